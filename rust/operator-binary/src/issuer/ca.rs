//! Signs certificates with a CA key pair stored in a Secret

use async_trait::async_trait;
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{self, api::DynamicObject, runtime::reflector::ObjectRef},
};
use time::OffsetDateTime;

use super::{IssuerBackend, IssuerBackendError};
use crate::{
    crd::{Certificate, CertificateSpec},
    pki::{self, CertificateTemplate, SigningCa},
    secret::{KeyPairPem, SecretStore, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY},
    utils::Unloggable,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load CA {secret}"))]
    FindCa {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("CA {secret} does not exist"))]
    CaNotFound { secret: ObjectRef<Secret> },

    #[snafu(display("CA {secret} is missing required key {key:?}"))]
    MissingCaData {
        key: &'static str,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to load CA certificate from {secret}"))]
    LoadCertificate {
        source: pki::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to load CA private key from {secret}"))]
    LoadKey {
        source: pki::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("CA private key in {secret} does not match its certificate"))]
    KeyMismatch { secret: ObjectRef<Secret> },

    #[snafu(display("failed to generate certificate key"))]
    GenerateKey { source: pki::Error },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: pki::Error },

    #[snafu(display("failed to serialize certificate"))]
    SerializeCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("certificate signing task failed"))]
    IssueTask { source: tokio::task::JoinError },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl IssuerBackendError for Error {
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::FindCa { secret, .. }
            | Error::CaNotFound { secret }
            | Error::MissingCaData { secret, .. }
            | Error::LoadCertificate { secret, .. }
            | Error::LoadKey { secret, .. }
            | Error::KeyMismatch { secret } => Some(secret.clone().erase()),
            Error::GenerateKey { .. }
            | Error::BuildCertificate { .. }
            | Error::SerializeCertificate { .. }
            | Error::IssueTask { .. } => None,
        }
    }
}

pub struct CaIssuerBackend {
    ca_cert: X509,
    ca_key: Unloggable<PKey<Private>>,
}

impl std::fmt::Debug for CaIssuerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaIssuerBackend")
            .field("ca", &pki::certificate_common_name(&self.ca_cert))
            .finish_non_exhaustive()
    }
}

impl CaIssuerBackend {
    /// Loads and verifies the CA key pair from the Secret `secret_name` in `namespace`.
    pub async fn load(secrets: &dyn SecretStore, namespace: &str, secret_name: &str) -> Result<Self> {
        let secret_ref = ObjectRef::<Secret>::new(secret_name).within(namespace);
        let secret = secrets
            .get(namespace, secret_name)
            .await
            .context(FindCaSnafu {
                secret: secret_ref.clone(),
            })?
            .context(CaNotFoundSnafu {
                secret: secret_ref.clone(),
            })?;
        Self::from_secret(&secret, secret_ref)
    }

    fn from_secret(secret: &Secret, secret_ref: ObjectRef<Secret>) -> Result<Self> {
        let data = |key: &'static str| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| value.0.as_slice())
                .filter(|value| !value.is_empty())
                .context(MissingCaDataSnafu {
                    key,
                    secret: secret_ref.clone(),
                })
        };
        let ca_cert = pki::decode_first_certificate(data(TLS_CERT_KEY)?).context(
            LoadCertificateSnafu {
                secret: secret_ref.clone(),
            },
        )?;
        let ca_key = pki::decode_private_key(data(TLS_PRIVATE_KEY_KEY)?).context(LoadKeySnafu {
            secret: secret_ref.clone(),
        })?;
        let key_matches = ca_cert
            .public_key()
            .map(|public_key| public_key.public_eq(&ca_key))
            .unwrap_or(false);
        if !key_matches {
            return KeyMismatchSnafu { secret: secret_ref }.fail();
        }
        Ok(Self {
            ca_cert,
            ca_key: Unloggable(ca_key),
        })
    }
}

#[async_trait]
impl IssuerBackend for CaIssuerBackend {
    type Error = Error;

    async fn issue(&self, certificate: &Certificate) -> Result<Option<KeyPairPem>, Self::Error> {
        let spec = certificate.spec.clone();
        let ca_cert = self.ca_cert.clone();
        let ca_key = Unloggable(self.ca_key.0.clone());
        let pem = tokio::task::spawn_blocking(move || issue_signed(&spec, &ca_cert, &ca_key))
            .await
            .context(IssueTaskSnafu)??;
        Ok(Some(pem))
    }
}

/// Generates a key for `spec` and signs its certificate with the CA.
fn issue_signed(spec: &CertificateSpec, ca_cert: &X509, ca_key: &PKey<Private>) -> Result<KeyPairPem> {
    let key = pki::generate_private_key(spec).context(GenerateKeySnafu)?;
    let issued = CertificateTemplate::from_spec(spec, OffsetDateTime::now_utc())
        .and_then(|template| {
            template.sign(
                &key,
                Some(SigningCa {
                    certificate: ca_cert,
                    key: ca_key,
                }),
            )
        })
        .context(BuildCertificateSnafu)?;
    let ca = ca_cert.to_pem().context(SerializeCertificateSnafu)?;
    let mut chain = issued.to_pem().context(SerializeCertificateSnafu)?;
    chain.extend_from_slice(&ca);
    Ok(KeyPairPem {
        certificate: chain,
        private_key: Unloggable(
            pki::encode_private_key(&key, spec.key_encoding.unwrap_or_default())
                .context(GenerateKeySnafu)?,
        ),
        ca,
    })
}
