//! Custom resources owned by the certificate-operator

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc},
    schemars::{self, JsonSchema},
};
use strum::{Display, EnumString};

mod certificate;
mod issuer;

pub use certificate::{
    AcmeCertificateConfig, AcmeDomainSolver, AcmeHttp01Solver, AcmeDns01Solver, Certificate,
    CertificateSpec, CertificateStatus, IssuerRef, KeyAlgorithm, KeyEncoding,
};
pub use issuer::{
    AcmeIssuer, CaIssuer, ClusterIssuer, ClusterIssuerSpec, GenericIssuer, Issuer, IssuerConfig,
    IssuerSpec, IssuerStatus, LocalObjectReference, SelfSignedIssuer,
};

pub const API_GROUP: &str = "certificates.stackable.tech";

pub const ISSUER_KIND: &str = "Issuer";
pub const CLUSTER_ISSUER_KIND: &str = "ClusterIssuer";
pub const CERTIFICATE_KIND: &str = "Certificate";

/// Label identifying the Certificate that owns a Secret
pub const LABEL_CERTIFICATE_NAME: &str = "certificates.stackable.tech/certificate-name";

pub const ANNOTATION_ISSUER_NAME: &str = "certificates.stackable.tech/issuer-name";
pub const ANNOTATION_ISSUER_KIND: &str = "certificates.stackable.tech/issuer-kind";
pub const ANNOTATION_COMMON_NAME: &str = "certificates.stackable.tech/common-name";
pub const ANNOTATION_ALT_NAMES: &str = "certificates.stackable.tech/alt-names";
pub const ANNOTATION_IP_SANS: &str = "certificates.stackable.tech/ip-sans";

pub const CONDITION_READY: &str = "Ready";

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Display, EnumString,
)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: Option<Time>,
}

/// Sets (or replaces) the condition of type `type_` in `conditions`.
///
/// The `lastTransitionTime` is only moved if the condition's status actually changes, so that
/// recomputing an unchanged condition does not produce a status update.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    now: stackable_operator::k8s_openapi::chrono::DateTime<Utc>,
) {
    let mut condition = Condition {
        type_: type_.to_string(),
        status,
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: Some(Time(now)),
    };
    match conditions.iter_mut().find(|cond| cond.type_ == type_) {
        Some(existing) => {
            if existing.status == status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|cond| cond.type_ == type_)
}
