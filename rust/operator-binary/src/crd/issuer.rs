use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::{CustomResource, ResourceExt},
    schemars::{self, JsonSchema},
};

use super::{
    find_condition, Condition, ConditionStatus, CLUSTER_ISSUER_KIND, CONDITION_READY, ISSUER_KIND,
};

/// An Issuer signs Certificates requested from the same namespace.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "certificates.stackable.tech",
    version = "v1alpha1",
    kind = "Issuer",
    namespaced,
    status = "IssuerStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSpec {
    #[serde(flatten)]
    pub config: IssuerConfig,
}

/// A ClusterIssuer signs Certificates requested from any namespace.
///
/// Using a ClusterIssuer requires the `use` permission on `clusterissuers`, which is checked
/// by the admission webhook.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "certificates.stackable.tech",
    version = "v1alpha1",
    kind = "ClusterIssuer",
    status = "IssuerStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIssuerSpec {
    #[serde(flatten)]
    pub config: IssuerConfig,
}

/// Exactly one backend must be configured.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuerConfig {
    /// Issue self-signed certificates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signed: Option<SelfSignedIssuer>,

    /// Sign certificates with a CA key pair stored in a Secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<CaIssuer>,

    /// Request certificates from an ACME server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acme: Option<AcmeIssuer>,
}

impl IssuerConfig {
    pub fn configured_backend_count(&self) -> usize {
        [
            self.self_signed.is_some(),
            self.ca.is_some(),
            self.acme.is_some(),
        ]
        .into_iter()
        .filter(|configured| *configured)
        .count()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SelfSignedIssuer {}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaIssuer {
    /// Secret containing `tls.crt` and `tls.key` of the CA.
    ///
    /// Looked up in the Issuer's namespace, or in the cluster resource namespace for ClusterIssuers.
    pub secret_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuer {
    pub server: String,
    pub email: String,
    pub private_key_secret_ref: LocalObjectReference,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuerStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Either kind of issuer, as resolved from a Certificate's `issuerRef`.
#[derive(Clone, Debug, PartialEq)]
pub enum GenericIssuer {
    Issuer(Issuer),
    ClusterIssuer(ClusterIssuer),
}

impl GenericIssuer {
    pub fn name(&self) -> String {
        match self {
            Self::Issuer(issuer) => issuer.name_any(),
            Self::ClusterIssuer(issuer) => issuer.name_any(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Issuer(_) => ISSUER_KIND,
            Self::ClusterIssuer(_) => CLUSTER_ISSUER_KIND,
        }
    }

    /// The namespace of a namespaced Issuer, `None` for ClusterIssuers.
    pub fn namespace(&self) -> Option<String> {
        match self {
            Self::Issuer(issuer) => issuer.namespace(),
            Self::ClusterIssuer(_) => None,
        }
    }

    pub fn config(&self) -> &IssuerConfig {
        match self {
            Self::Issuer(issuer) => &issuer.spec.config,
            Self::ClusterIssuer(issuer) => &issuer.spec.config,
        }
    }

    pub fn status(&self) -> Option<&IssuerStatus> {
        match self {
            Self::Issuer(issuer) => issuer.status.as_ref(),
            Self::ClusterIssuer(issuer) => issuer.status.as_ref(),
        }
    }

    pub fn status_mut(&mut self) -> &mut IssuerStatus {
        match self {
            Self::Issuer(issuer) => issuer.status.get_or_insert_with(Default::default),
            Self::ClusterIssuer(issuer) => issuer.status.get_or_insert_with(Default::default),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status()
            .and_then(|status| find_condition(&status.conditions, CONDITION_READY))
            .is_some_and(|cond| cond.status == ConditionStatus::True)
    }
}
