//! Signs certificates on behalf of an `Issuer` or `ClusterIssuer`

pub mod ca;
pub mod dynamic;
pub mod self_signed;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use stackable_operator::kube::{api::DynamicObject, runtime::reflector::ObjectRef};

pub use ca::CaIssuerBackend;
pub use dynamic::{Dynamic, FromIssuerError};
pub use self_signed::SelfSignedIssuerBackend;

use crate::{
    crd::{Certificate, GenericIssuer},
    secret::{KeyPairPem, SecretStore},
};

#[async_trait]
pub trait IssuerBackend: Debug + Send + Sync {
    type Error: IssuerBackendError;

    /// Issues key material for `certificate`.
    ///
    /// A response with an empty `certificate` means that only a new private key is available
    /// so far, and the certificate will follow on a later pass. `None` means that the
    /// backend has nothing to offer yet.
    async fn issue(&self, certificate: &Certificate) -> Result<Option<KeyPairPem>, Self::Error>;
}

pub trait IssuerBackendError: std::error::Error + Send + Sync + 'static {
    /// The object (other than the Certificate itself) that the error is about, if any.
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        None
    }
}

/// Resolves a configured issuer into the backend that signs for it.
#[async_trait]
pub trait IssuerFactory: Send + Sync {
    async fn backend_for(&self, issuer: &GenericIssuer) -> Result<Box<Dynamic>, FromIssuerError>;
}

pub struct KubeIssuerFactory {
    secrets: Arc<dyn SecretStore>,
    cluster_resource_namespace: String,
}

impl KubeIssuerFactory {
    pub fn new(secrets: Arc<dyn SecretStore>, cluster_resource_namespace: impl Into<String>) -> Self {
        Self {
            secrets,
            cluster_resource_namespace: cluster_resource_namespace.into(),
        }
    }

    /// The namespace that Secrets referenced by `issuer` are looked up in.
    pub fn resource_namespace(&self, issuer: &GenericIssuer) -> String {
        issuer
            .namespace()
            .unwrap_or_else(|| self.cluster_resource_namespace.clone())
    }
}

#[async_trait]
impl IssuerFactory for KubeIssuerFactory {
    async fn backend_for(&self, issuer: &GenericIssuer) -> Result<Box<Dynamic>, FromIssuerError> {
        dynamic::from_issuer(
            self.secrets.as_ref(),
            issuer,
            &self.resource_namespace(issuer),
        )
        .await
    }
}
