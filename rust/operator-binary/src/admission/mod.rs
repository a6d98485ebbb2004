//! Validating admission webhook for Certificates, Issuers and ClusterIssuers.
//!
//! Every request is decoded, authenticated (if an [`Authenticator`] is registered for its
//! kind) and then validated. Each step maps its failure onto a distinct status code.

use std::{collections::HashMap, sync::Arc};

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::kube::core::{
    admission::{AdmissionRequest, AdmissionResponse},
    DynamicObject, GroupVersionKind,
};
use strum::IntoStaticStr;

use crate::{
    crd::{Certificate, ClusterIssuer, Issuer, API_GROUP, CERTIFICATE_KIND, CLUSTER_ISSUER_KIND, ISSUER_KIND},
    validation::{self, FieldError},
};

mod authenticator;
pub mod server;

pub use authenticator::{
    AccessReviewer, Authentication, Authenticator, AuthorizationError, CertificateAuthenticator,
    SubjectAccessReviewer,
};

/// Why a request was rejected, named after the `metav1.StatusReason` it is reported as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum RejectReason {
    BadRequest,
    Forbidden,
    InternalError,
    NotAcceptable,
}

impl RejectReason {
    pub fn code(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::InternalError => 500,
            Self::NotAcceptable => 406,
        }
    }
}

/// Denies `response`, reporting `reason` and its status code alongside `message`.
fn reject(
    response: AdmissionResponse,
    reason: RejectReason,
    message: impl ToString,
) -> AdmissionResponse {
    let mut response = response.deny(message);
    response.result.code = reason.code();
    response.result.reason = <&str>::from(reason).to_string();
    response
}

/// Rejects a review that did not contain a usable request.
pub fn reject_invalid(message: impl ToString) -> AdmissionResponse {
    reject(
        AdmissionResponse::invalid(message.to_string()),
        RejectReason::BadRequest,
        message,
    )
}

fn display_kind(kind: &GroupVersionKind) -> String {
    format!("{}/{}, Kind={}", kind.group, kind.version, kind.kind)
}

/// An object of one of the kinds that can be admitted.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionObject {
    Certificate(Certificate),
    Issuer(Issuer),
    ClusterIssuer(ClusterIssuer),
}

#[derive(Debug, Snafu)]
pub enum DecodeError {
    #[snafu(display("unsupported kind {kind}"))]
    UnsupportedKind { kind: String },

    #[snafu(display("request does not contain an object"))]
    MissingObject,

    #[snafu(display("failed to decode {kind}"))]
    Deserialize {
        source: serde_json::Error,
        kind: &'static str,
    },
}

impl AdmissionObject {
    pub fn decode(
        kind: &GroupVersionKind,
        object: Option<&DynamicObject>,
    ) -> Result<Self, DecodeError> {
        let unsupported = || UnsupportedKindSnafu {
            kind: display_kind(kind),
        };
        if kind.group != API_GROUP {
            return unsupported().fail();
        }
        let decode_as = match kind.kind.as_str() {
            CERTIFICATE_KIND => CERTIFICATE_KIND,
            ISSUER_KIND => ISSUER_KIND,
            CLUSTER_ISSUER_KIND => CLUSTER_ISSUER_KIND,
            _ => return unsupported().fail(),
        };
        let object = object.context(MissingObjectSnafu)?;
        let context = DeserializeSnafu { kind: decode_as };
        let object = serde_json::to_value(object).context(context)?;
        Ok(match decode_as {
            CERTIFICATE_KIND => Self::Certificate(serde_json::from_value(object).context(context)?),
            ISSUER_KIND => Self::Issuer(serde_json::from_value(object).context(context)?),
            _ => Self::ClusterIssuer(serde_json::from_value(object).context(context)?),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Certificate(_) => CERTIFICATE_KIND,
            Self::Issuer(_) => ISSUER_KIND,
            Self::ClusterIssuer(_) => CLUSTER_ISSUER_KIND,
        }
    }
}

pub type Validator = fn(&AdmissionObject) -> Vec<FieldError>;

fn validate_certificate(object: &AdmissionObject) -> Vec<FieldError> {
    match object {
        AdmissionObject::Certificate(certificate) => validation::validate_certificate(&certificate.spec),
        _ => Vec::new(),
    }
}

fn validate_issuer(object: &AdmissionObject) -> Vec<FieldError> {
    match object {
        AdmissionObject::Issuer(issuer) => validation::validate_issuer_config(&issuer.spec.config),
        AdmissionObject::ClusterIssuer(issuer) => {
            validation::validate_issuer_config(&issuer.spec.config)
        }
        AdmissionObject::Certificate(_) => Vec::new(),
    }
}

/// The validators and authenticators of the webhook, keyed by kind.
///
/// Built once at start-up and shared between all requests.
#[derive(Default)]
pub struct AdmissionRegistry {
    validators: HashMap<&'static str, Validator>,
    authenticators: HashMap<&'static str, Arc<dyn Authenticator>>,
}

impl AdmissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry served by the operator, checking ClusterIssuer use with `reviewer`.
    pub fn standard(reviewer: Arc<dyn AccessReviewer>) -> Self {
        Self::new()
            .with_validator(CERTIFICATE_KIND, validate_certificate)
            .with_validator(ISSUER_KIND, validate_issuer)
            .with_validator(CLUSTER_ISSUER_KIND, validate_issuer)
            .with_authenticator(
                CERTIFICATE_KIND,
                Arc::new(CertificateAuthenticator::new(reviewer)),
            )
    }

    pub fn with_validator(mut self, kind: &'static str, validator: Validator) -> Self {
        self.validators.insert(kind, validator);
        self
    }

    pub fn with_authenticator(
        mut self,
        kind: &'static str,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        self.authenticators.insert(kind, authenticator);
        self
    }

    #[tracing::instrument(
        skip(self, request),
        fields(uid = %request.uid, kind = %request.kind.kind, user = ?request.user_info.username),
    )]
    pub async fn review(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let response = AdmissionResponse::from(request);
        let object = match AdmissionObject::decode(&request.kind, request.object.as_ref()) {
            Ok(object) => object,
            Err(error) => {
                tracing::debug!(
                    error = &error as &dyn std::error::Error,
                    "rejecting undecodable request"
                );
                return reject(
                    response,
                    RejectReason::BadRequest,
                    crate::utils::error_full_message(&error),
                );
            }
        };
        let kind = object.kind();

        if let Some(authenticator) = self.authenticators.get(kind) {
            if let Authentication::Denied(message) =
                authenticator.authenticate(request, &object).await
            {
                return reject(response, RejectReason::Forbidden, message);
            }
        }

        let Some(validate) = self.validators.get(kind) else {
            tracing::error!("no validator registered");
            return reject(
                response,
                RejectReason::InternalError,
                format!(
                    "No validation function registered for {}",
                    display_kind(&request.kind)
                ),
            );
        };
        if let Some(errors) = validation::aggregate(&validate(&object)) {
            tracing::debug!(%errors, "rejecting invalid object");
            return reject(response, RejectReason::NotAcceptable, errors);
        }
        response
    }
}
