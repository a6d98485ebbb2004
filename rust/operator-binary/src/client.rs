//! Access to the certificate-operator's own resources.

use std::sync::Arc;

use async_trait::async_trait;
use stackable_operator::kube::{self, api::PostParams, runtime::reflector, Api, ResourceExt};

use crate::crd::{Certificate, ClusterIssuer, GenericIssuer, Issuer};

#[async_trait]
pub trait CertificateClient: Send + Sync {
    async fn get_certificate(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Certificate>, kube::Error>;

    /// All Certificates currently known to the controller, from every watched namespace.
    fn tracked_certificates(&self) -> Vec<Arc<Certificate>>;

    async fn get_issuer(&self, namespace: &str, name: &str)
        -> Result<Option<Issuer>, kube::Error>;

    async fn get_cluster_issuer(&self, name: &str) -> Result<Option<ClusterIssuer>, kube::Error>;

    /// Replaces the status of `certificate`, failing if it was modified since it was read.
    async fn replace_certificate_status(&self, certificate: &Certificate)
        -> Result<(), kube::Error>;

    async fn replace_issuer_status(&self, issuer: &GenericIssuer) -> Result<(), kube::Error>;
}

pub struct KubeCertificateClient {
    client: kube::Client,
    certificates: reflector::Store<Certificate>,
}

impl KubeCertificateClient {
    /// `certificates` is the cache filled by the certificate controller's watch.
    pub fn new(client: kube::Client, certificates: reflector::Store<Certificate>) -> Self {
        Self {
            client,
            certificates,
        }
    }
}

async fn replace_status<K>(api: Api<K>, object: &K) -> Result<(), kube::Error>
where
    K: kube::Resource + serde::Serialize + serde::de::DeserializeOwned + Clone + std::fmt::Debug,
{
    let data = serde_json::to_vec(object).map_err(kube::Error::SerdeError)?;
    api.replace_status(&object.name_any(), &PostParams::default(), data)
        .await?;
    Ok(())
}

#[async_trait]
impl CertificateClient for KubeCertificateClient {
    async fn get_certificate(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Certificate>, kube::Error> {
        Api::<Certificate>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    fn tracked_certificates(&self) -> Vec<Arc<Certificate>> {
        self.certificates.state()
    }

    async fn get_issuer(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Issuer>, kube::Error> {
        Api::<Issuer>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn get_cluster_issuer(&self, name: &str) -> Result<Option<ClusterIssuer>, kube::Error> {
        Api::<ClusterIssuer>::all(self.client.clone())
            .get_opt(name)
            .await
    }

    async fn replace_certificate_status(
        &self,
        certificate: &Certificate,
    ) -> Result<(), kube::Error> {
        let namespace = certificate.namespace().unwrap_or_default();
        replace_status(
            Api::<Certificate>::namespaced(self.client.clone(), &namespace),
            certificate,
        )
        .await
    }

    async fn replace_issuer_status(&self, issuer: &GenericIssuer) -> Result<(), kube::Error> {
        match issuer {
            GenericIssuer::Issuer(issuer) => {
                let namespace = issuer.namespace().unwrap_or_default();
                replace_status(
                    Api::<Issuer>::namespaced(self.client.clone(), &namespace),
                    issuer,
                )
                .await
            }
            GenericIssuer::ClusterIssuer(issuer) => {
                replace_status(Api::<ClusterIssuer>::all(self.client.clone()), issuer).await
            }
        }
    }
}
