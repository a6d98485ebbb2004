use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time,
    kube::CustomResource,
    schemars::{self, JsonSchema},
    time::Duration,
};

use super::{Condition, CLUSTER_ISSUER_KIND, ISSUER_KIND};

/// A Certificate describes a desired X.509 certificate and the Secret it should be stored in.
///
/// The certificate-operator will ensure that the Secret `secretName` contains a valid key pair
/// matching these settings, and renews it before it expires.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "certificates.stackable.tech",
    version = "v1alpha1",
    kind = "Certificate",
    namespaced,
    status = "CertificateStatus",
    shortname = "cert",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Name of the Secret (in the same namespace) that the key pair is written to.
    pub secret_name: String,

    /// Common name of the certificate subject.
    /// Defaults to the first DNS name if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,

    #[serde(default)]
    pub dns_names: Vec<String>,

    #[serde(default)]
    pub ip_addresses: Vec<String>,

    #[serde(default)]
    pub organization: Vec<String>,

    /// Whether the issued certificate may be used to sign other certificates.
    #[serde(default, rename = "isCA")]
    pub is_ca: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_algorithm: Option<KeyAlgorithm>,

    /// Key size in bits. Defaults to 2048 for RSA and 256 for ECDSA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_encoding: Option<KeyEncoding>,

    pub issuer_ref: IssuerRef,

    /// Requested validity of the certificate, for example `90d`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,

    /// How long before expiry the certificate should be renewed, for example `30d`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_before: Option<Duration>,

    /// Solver configuration, only used by ACME issuers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acme: Option<AcmeCertificateConfig>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    #[default]
    Rsa,
    Ecdsa,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum KeyEncoding {
    #[default]
    Pkcs1,
    Pkcs8,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    pub name: String,

    /// Either `Issuer` (the default) or `ClusterIssuer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl IssuerRef {
    /// The referenced kind, with the empty kind meaning a namespaced [`ISSUER_KIND`].
    pub fn kind(&self) -> &str {
        match self.kind.as_deref() {
            None | Some("") => ISSUER_KIND,
            Some(kind) => kind,
        }
    }

    pub fn is_cluster_issuer(&self) -> bool {
        self.kind() == CLUSTER_ISSUER_KIND
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcmeCertificateConfig {
    pub config: Vec<AcmeDomainSolver>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcmeDomainSolver {
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http01: Option<AcmeHttp01Solver>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns01: Option<AcmeDns01Solver>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcmeHttp01Solver {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcmeDns01Solver {
    pub provider: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Expiry of the certificate currently stored in the Secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<Time>,
}
