//! Support code for issuer backends that are picked at runtime

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use snafu::Snafu;
use stackable_operator::kube::{api::DynamicObject, runtime::reflector::ObjectRef};

use super::{ca, CaIssuerBackend, IssuerBackend, IssuerBackendError, SelfSignedIssuerBackend};
use crate::{
    crd::{Certificate, GenericIssuer},
    secret::{KeyPairPem, SecretStore},
};

pub struct DynError(Box<dyn IssuerBackendError>);

impl Debug for DynError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for DynError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for DynError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl IssuerBackendError for DynError {
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        self.0.secondary_object()
    }
}

pub struct DynamicAdapter<B>(B);

impl<B: Debug> Debug for DynamicAdapter<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[async_trait]
impl<B: IssuerBackend> IssuerBackend for DynamicAdapter<B> {
    type Error = DynError;

    async fn issue(&self, certificate: &Certificate) -> Result<Option<KeyPairPem>, Self::Error> {
        self.0
            .issue(certificate)
            .await
            .map_err(|err| DynError(Box::new(err)))
    }
}

pub type Dynamic = dyn IssuerBackend<Error = DynError>;
pub fn from(backend: impl IssuerBackend + 'static) -> Box<Dynamic> {
    Box::new(DynamicAdapter(backend))
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum FromIssuerError {
    #[snafu(display("issuer does not configure a backend"))]
    NoBackend,

    #[snafu(display("ACME issuers are not supported by this operator"))]
    AcmeUnsupported,

    #[snafu(display("failed to initialize CA backend"), context(false))]
    Ca { source: ca::Error },
}

impl IssuerBackendError for FromIssuerError {
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            FromIssuerError::NoBackend | FromIssuerError::AcmeUnsupported => None,
            FromIssuerError::Ca { source } => source.secondary_object(),
        }
    }
}

/// Builds the backend for `issuer`, loading any referenced Secrets from `resource_namespace`.
pub async fn from_issuer(
    secrets: &dyn SecretStore,
    issuer: &GenericIssuer,
    resource_namespace: &str,
) -> Result<Box<Dynamic>, FromIssuerError> {
    let config = issuer.config();
    if let Some(ca) = &config.ca {
        Ok(from(
            CaIssuerBackend::load(secrets, resource_namespace, &ca.secret_name).await?,
        ))
    } else if config.self_signed.is_some() {
        Ok(from(SelfSignedIssuerBackend))
    } else if config.acme.is_some() {
        from_issuer_error::AcmeUnsupportedSnafu.fail()
    } else {
        from_issuer_error::NoBackendSnafu.fail()
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::kube::api::ObjectMeta;

    use super::*;
    use crate::{
        crd::{AcmeIssuer, ClusterIssuer, ClusterIssuerSpec, IssuerConfig, SelfSignedIssuer},
        test_support::FakeSecretStore,
    };

    fn cluster_issuer(config: IssuerConfig) -> GenericIssuer {
        GenericIssuer::ClusterIssuer(ClusterIssuer {
            metadata: ObjectMeta {
                name: Some("test".to_string()),
                ..ObjectMeta::default()
            },
            spec: ClusterIssuerSpec { config },
            status: None,
        })
    }

    #[tokio::test]
    async fn acme_issuers_fail_to_initialize() {
        let issuer = cluster_issuer(IssuerConfig {
            acme: Some(AcmeIssuer::default()),
            ..IssuerConfig::default()
        });
        let err = from_issuer(&FakeSecretStore::default(), &issuer, "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, FromIssuerError::AcmeUnsupported));
    }

    #[tokio::test]
    async fn empty_issuers_fail_to_initialize() {
        let issuer = cluster_issuer(IssuerConfig::default());
        let err = from_issuer(&FakeSecretStore::default(), &issuer, "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, FromIssuerError::NoBackend));
    }

    #[tokio::test]
    async fn self_signed_issuers_need_no_secrets() {
        let issuer = cluster_issuer(IssuerConfig {
            self_signed: Some(SelfSignedIssuer {}),
            ..IssuerConfig::default()
        });
        assert!(from_issuer(&FakeSecretStore::default(), &issuer, "ops")
            .await
            .is_ok());
    }
}
