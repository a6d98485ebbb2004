//! Storage of issued key pairs in `kubernetes.io/tls` Secrets.

use std::collections::BTreeMap;

use async_trait::async_trait;
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::{
        self,
        api::{ObjectMeta, PostParams},
        runtime::reflector::ObjectRef,
        Api, Resource, ResourceExt,
    },
};

use crate::{
    crd::{
        Certificate, ANNOTATION_ALT_NAMES, ANNOTATION_COMMON_NAME, ANNOTATION_IP_SANS,
        ANNOTATION_ISSUER_KIND, ANNOTATION_ISSUER_NAME, LABEL_CERTIFICATE_NAME,
    },
    pki,
};

pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
pub const TLS_CA_KEY: &str = "ca.crt";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {secret}"))]
    GetSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to create {secret}"))]
    CreateSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to update {secret}"))]
    UpdateSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("invalid certificate data"))]
    InvalidCertificate { source: pki::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error>;
    async fn create(&self, secret: &Secret) -> Result<Secret, kube::Error>;
    async fn update(&self, secret: &Secret) -> Result<Secret, kube::Error>;
}

pub struct KubeSecretStore {
    client: kube::Client,
}

impl KubeSecretStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, secret: &Secret) -> Api<Secret> {
        Api::namespaced(
            self.client.clone(),
            secret.metadata.namespace.as_deref().unwrap_or_default(),
        )
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, kube::Error> {
        self.api(secret)
            .create(&PostParams::default(), secret)
            .await
    }

    async fn update(&self, secret: &Secret) -> Result<Secret, kube::Error> {
        self.api(secret)
            .replace(&secret.name_any(), &PostParams::default(), secret)
            .await
    }
}

/// The PEM-encoded material returned by an issuer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPairPem {
    pub certificate: Vec<u8>,
    pub private_key: crate::utils::Unloggable<Vec<u8>>,
    pub ca: Vec<u8>,
}

/// What [`update_secret`] did to the Secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretWrite {
    Created,
    Updated,
    /// There was no Secret yet, and no certificate to create it with.
    Skipped,
}

fn secret_data(secret: &Secret, key: &str) -> Option<&[u8]> {
    secret
        .data
        .as_ref()?
        .get(key)
        .map(|value| value.0.as_slice())
        .filter(|value| !value.is_empty())
}

/// Parses the key pair stored in `secret`.
///
/// Missing or unparsable material yields `None` rather than an error, so that it gets reissued.
pub fn parse_key_pair(secret: &Secret) -> Option<(PKey<Private>, X509)> {
    let key = secret_data(secret, TLS_PRIVATE_KEY_KEY)?;
    let cert = secret_data(secret, TLS_CERT_KEY)?;
    let parsed = pki::decode_private_key(key).and_then(|key| {
        let cert = pki::decode_first_certificate(cert)?;
        Ok((key, cert))
    });
    match parsed {
        Ok(pair) => Some(pair),
        Err(error) => {
            tracing::debug!(
                secret = %ObjectRef::from_obj(secret),
                error = &error as &dyn std::error::Error,
                "ignoring unparsable key pair"
            );
            None
        }
    }
}

/// Writes `pem` into the Secret named by `certificate`, creating it if needed.
///
/// Labels, annotations and data keys not owned by the certificate-operator are preserved.
/// A response without a certificate only updates the private key of an existing Secret, and
/// never creates one.
pub async fn update_secret(
    store: &dyn SecretStore,
    certificate: &Certificate,
    namespace: &str,
    pem: &KeyPairPem,
    enable_owner_ref: bool,
) -> Result<SecretWrite> {
    let secret_name = &certificate.spec.secret_name;
    let secret_ref = ObjectRef::<Secret>::new(secret_name).within(namespace);
    let existing = store
        .get(namespace, secret_name)
        .await
        .context(GetSecretSnafu {
            secret: secret_ref.clone(),
        })?;

    if pem.certificate.is_empty() {
        let Some(mut secret) = existing else {
            return Ok(SecretWrite::Skipped);
        };
        secret.data.get_or_insert_with(BTreeMap::new).insert(
            TLS_PRIVATE_KEY_KEY.to_string(),
            ByteString(pem.private_key.to_vec()),
        );
        secret
            .labels_mut()
            .insert(LABEL_CERTIFICATE_NAME.to_string(), certificate.name_any());
        store
            .update(&secret)
            .await
            .context(UpdateSecretSnafu { secret: secret_ref })?;
        return Ok(SecretWrite::Updated);
    }

    let issued = pki::decode_first_certificate(&pem.certificate).context(InvalidCertificateSnafu)?;
    let is_new = existing.is_none();
    let mut secret = existing.unwrap_or_else(|| Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(namespace.to_string()),
            owner_references: enable_owner_ref
                .then(|| certificate.controller_owner_ref(&()))
                .flatten()
                .map(|owner| vec![owner]),
            ..ObjectMeta::default()
        },
        type_: Some(SECRET_TYPE_TLS.to_string()),
        ..Secret::default()
    });

    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.insert(
        TLS_CERT_KEY.to_string(),
        ByteString(pem.certificate.clone()),
    );
    data.insert(
        TLS_PRIVATE_KEY_KEY.to_string(),
        ByteString(pem.private_key.to_vec()),
    );
    data.insert(TLS_CA_KEY.to_string(), ByteString(pem.ca.clone()));

    let annotations = secret.annotations_mut();
    annotations.insert(
        ANNOTATION_ISSUER_NAME.to_string(),
        certificate.spec.issuer_ref.name.clone(),
    );
    annotations.insert(
        ANNOTATION_ISSUER_KIND.to_string(),
        certificate.spec.issuer_ref.kind().to_string(),
    );
    annotations.insert(
        ANNOTATION_COMMON_NAME.to_string(),
        pki::certificate_common_name(&issued),
    );
    annotations.insert(
        ANNOTATION_ALT_NAMES.to_string(),
        pki::certificate_dns_names(&issued).join(","),
    );
    annotations.insert(
        ANNOTATION_IP_SANS.to_string(),
        pki::certificate_ip_addresses(&issued).join(","),
    );
    secret
        .labels_mut()
        .insert(LABEL_CERTIFICATE_NAME.to_string(), certificate.name_any());

    if is_new {
        store
            .create(&secret)
            .await
            .context(CreateSecretSnafu { secret: secret_ref })?;
        Ok(SecretWrite::Created)
    } else {
        store
            .update(&secret)
            .await
            .context(UpdateSecretSnafu { secret: secret_ref })?;
        Ok(SecretWrite::Updated)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use stackable_operator::{
        k8s_openapi::{api::core::v1::Secret, ByteString},
        kube::{api::ObjectMeta, ResourceExt},
    };

    use super::*;
    use crate::{
        crd::{CertificateSpec, IssuerRef},
        test_support::{self_signed_pem, tls_secret, FakeSecretStore},
    };

    fn certificate() -> Certificate {
        let mut certificate = Certificate::new(
            "example",
            CertificateSpec {
                secret_name: "output".to_string(),
                dns_names: vec!["example.com".to_string()],
                ip_addresses: vec!["10.0.0.1".to_string()],
                issuer_ref: IssuerRef {
                    name: "test".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        certificate.metadata.namespace = Some("default".to_string());
        certificate.metadata.uid = Some("1234".to_string());
        certificate
    }

    #[tokio::test]
    async fn creates_secret_with_annotations() {
        let store = FakeSecretStore::default();
        let certificate = certificate();
        let pem = self_signed_pem(&certificate.spec);

        let write = update_secret(&store, &certificate, "default", &pem, true)
            .await
            .unwrap();
        assert_eq!(write, SecretWrite::Created);

        let secret = store.secret("default", "output").unwrap();
        assert_eq!(secret.type_.as_deref(), Some(SECRET_TYPE_TLS));
        assert_eq!(
            secret.labels().get(LABEL_CERTIFICATE_NAME).map(String::as_str),
            Some("example")
        );
        let annotations = secret.annotations();
        assert_eq!(annotations[ANNOTATION_ISSUER_NAME], "test");
        assert_eq!(annotations[ANNOTATION_ISSUER_KIND], "Issuer");
        assert_eq!(annotations[ANNOTATION_COMMON_NAME], "example.com");
        assert_eq!(annotations[ANNOTATION_ALT_NAMES], "example.com");
        assert_eq!(annotations[ANNOTATION_IP_SANS], "10.0.0.1");
        assert_eq!(
            secret.metadata.owner_references.as_ref().unwrap()[0].name,
            "example"
        );
        assert!(parse_key_pair(&secret).is_some());
    }

    #[tokio::test]
    async fn update_preserves_foreign_metadata() {
        let store = FakeSecretStore::default();
        store.insert(Secret {
            metadata: ObjectMeta {
                name: Some("output".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(BTreeMap::from([("team".to_string(), "a".to_string())])),
                annotations: Some(BTreeMap::from([(
                    "note".to_string(),
                    "keep me".to_string(),
                )])),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(
                "extra".to_string(),
                ByteString(b"x".to_vec()),
            )])),
            ..Secret::default()
        });
        let certificate = certificate();

        let write = update_secret(
            &store,
            &certificate,
            "default",
            &self_signed_pem(&certificate.spec),
            false,
        )
        .await
        .unwrap();
        assert_eq!(write, SecretWrite::Updated);

        let secret = store.secret("default", "output").unwrap();
        assert_eq!(secret.labels()["team"], "a");
        assert_eq!(secret.labels()[LABEL_CERTIFICATE_NAME], "example");
        assert_eq!(secret.annotations()["note"], "keep me");
        assert_eq!(secret.annotations()[ANNOTATION_COMMON_NAME], "example.com");
        assert!(secret.data.as_ref().unwrap().contains_key("extra"));
        assert!(secret.metadata.owner_references.is_none());
    }

    #[tokio::test]
    async fn key_only_response_never_creates_a_secret() {
        let store = FakeSecretStore::default();
        let pem = KeyPairPem {
            private_key: crate::utils::Unloggable(b"pk1".to_vec()),
            ..KeyPairPem::default()
        };
        let write = update_secret(&store, &certificate(), "default", &pem, false)
            .await
            .unwrap();
        assert_eq!(write, SecretWrite::Skipped);
        assert!(store.secret("default", "output").is_none());
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn key_only_response_leaves_annotations_alone() {
        let store = FakeSecretStore::default();
        let certificate = certificate();
        update_secret(
            &store,
            &certificate,
            "default",
            &self_signed_pem(&certificate.spec),
            false,
        )
        .await
        .unwrap();
        let before = store.secret("default", "output").unwrap();

        let pem = KeyPairPem {
            private_key: crate::utils::Unloggable(b"pk2".to_vec()),
            ..KeyPairPem::default()
        };
        let write = update_secret(&store, &certificate, "default", &pem, false)
            .await
            .unwrap();
        assert_eq!(write, SecretWrite::Updated);

        let after = store.secret("default", "output").unwrap();
        assert_eq!(after.annotations(), before.annotations());
        let data = after.data.unwrap();
        assert_eq!(data[TLS_PRIVATE_KEY_KEY].0, b"pk2");
        assert_eq!(data[TLS_CERT_KEY], before.data.unwrap()[TLS_CERT_KEY]);
    }

    #[tokio::test]
    async fn key_only_response_labels_the_secret() {
        let store = FakeSecretStore::default();
        let certificate = certificate();
        store.insert(tls_secret(
            "default",
            "output",
            &self_signed_pem(&certificate.spec),
        ));

        let pem = KeyPairPem {
            private_key: crate::utils::Unloggable(b"pk2".to_vec()),
            ..KeyPairPem::default()
        };
        update_secret(&store, &certificate, "default", &pem, false)
            .await
            .unwrap();
        let secret = store.secret("default", "output").unwrap();
        assert_eq!(secret.labels()[LABEL_CERTIFICATE_NAME], "example");
    }

    #[test]
    fn unparsable_material_is_absent() {
        let secret = Secret {
            data: Some(BTreeMap::from([
                (TLS_CERT_KEY.to_string(), ByteString(b"garbage".to_vec())),
                (TLS_PRIVATE_KEY_KEY.to_string(), ByteString(b"garbage".to_vec())),
            ])),
            ..Secret::default()
        };
        assert!(parse_key_pair(&secret).is_none());
        assert!(parse_key_pair(&Secret::default()).is_none());
    }
}
