use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use time::OffsetDateTime;

use super::{IssuerBackend, IssuerBackendError};
use crate::{
    crd::{Certificate, CertificateSpec},
    pki::{self, CertificateTemplate},
    secret::KeyPairPem,
    utils::Unloggable,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate certificate key"))]
    GenerateKey { source: pki::Error },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: pki::Error },

    #[snafu(display("failed to serialize certificate"))]
    SerializeCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("certificate signing task failed"))]
    IssueTask { source: tokio::task::JoinError },
}

impl IssuerBackendError for Error {}

/// Signs every certificate with its own private key.
#[derive(Debug)]
pub struct SelfSignedIssuerBackend;

#[async_trait]
impl IssuerBackend for SelfSignedIssuerBackend {
    type Error = Error;

    async fn issue(&self, certificate: &Certificate) -> Result<Option<KeyPairPem>, Self::Error> {
        let spec = certificate.spec.clone();
        let pem = tokio::task::spawn_blocking(move || issue_self_signed(&spec))
            .await
            .context(IssueTaskSnafu)??;
        Ok(Some(pem))
    }
}

fn issue_self_signed(spec: &CertificateSpec) -> Result<KeyPairPem, Error> {
    let key = pki::generate_private_key(spec).context(GenerateKeySnafu)?;
    let cert = CertificateTemplate::from_spec(spec, OffsetDateTime::now_utc())
        .and_then(|template| template.sign(&key, None))
        .context(BuildCertificateSnafu)?
        .to_pem()
        .context(SerializeCertificateSnafu)?;
    Ok(KeyPairPem {
        ca: cert.clone(),
        certificate: cert,
        private_key: Unloggable(
            pki::encode_private_key(&key, spec.key_encoding.unwrap_or_default())
                .context(GenerateKeySnafu)?,
        ),
    })
}
