//! Checks whether the requesting user may use the issuer referenced by a Certificate.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::authorization::v1::{
        ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
    },
    kube::{
        self,
        api::PostParams,
        core::{admission::AdmissionRequest, DynamicObject},
        Api, ResourceExt,
    },
};

use super::AdmissionObject;
use crate::crd::API_GROUP;

const CLUSTER_ISSUERS_RESOURCE: &str = "clusterissuers";
const USE_VERB: &str = "use";

#[derive(Debug, Snafu)]
pub enum AuthorizationError {
    #[snafu(display("failed to create SubjectAccessReview"))]
    Review { source: kube::Error },

    #[snafu(display("SubjectAccessReview did not complete within {timeout:?}"))]
    Timeout { timeout: Duration },
}

/// Asks the cluster's authorizer whether a user may perform an action.
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    async fn check_access(
        &self,
        verb: &str,
        group: &str,
        resource: &str,
        user: &str,
        groups: &[String],
    ) -> Result<bool, AuthorizationError>;
}

/// [`AccessReviewer`] backed by `SubjectAccessReview`s.
pub struct SubjectAccessReviewer {
    client: kube::Client,
    timeout: Duration,
}

impl SubjectAccessReviewer {
    pub fn new(client: kube::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl AccessReviewer for SubjectAccessReviewer {
    async fn check_access(
        &self,
        verb: &str,
        group: &str,
        resource: &str,
        user: &str,
        groups: &[String],
    ) -> Result<bool, AuthorizationError> {
        let review = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    verb: Some(verb.to_string()),
                    group: Some(group.to_string()),
                    resource: Some(resource.to_string()),
                    ..ResourceAttributes::default()
                }),
                user: Some(user.to_string()),
                groups: Some(groups.to_vec()),
                ..SubjectAccessReviewSpec::default()
            },
            ..SubjectAccessReview::default()
        };
        let api = Api::<SubjectAccessReview>::all(self.client.clone());
        let created = tokio::time::timeout(self.timeout, api.create(&PostParams::default(), &review))
            .await
            .map_err(|_| AuthorizationError::Timeout {
                timeout: self.timeout,
            })?
            .context(ReviewSnafu)?;
        Ok(created.status.is_some_and(|status| status.allowed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Allowed,
    Denied(String),
}

/// Runs before validation for the kinds it is registered for.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        object: &AdmissionObject,
    ) -> Authentication;
}

/// Only lets users that may `use` `clusterissuers` create Certificates signed by a
/// ClusterIssuer. Certificates referencing namespaced Issuers are always allowed.
pub struct CertificateAuthenticator {
    reviewer: Arc<dyn AccessReviewer>,
}

impl CertificateAuthenticator {
    pub fn new(reviewer: Arc<dyn AccessReviewer>) -> Self {
        Self { reviewer }
    }
}

#[async_trait]
impl Authenticator for CertificateAuthenticator {
    async fn authenticate(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        object: &AdmissionObject,
    ) -> Authentication {
        let AdmissionObject::Certificate(certificate) = object else {
            return Authentication::Allowed;
        };
        let issuer_ref = &certificate.spec.issuer_ref;
        if !issuer_ref.is_cluster_issuer() {
            return Authentication::Allowed;
        }

        let user = request.user_info.username.as_deref().unwrap_or_default();
        let groups = request.user_info.groups.as_deref().unwrap_or_default();
        let denied = || {
            Authentication::Denied(format!(
                "User: {} is not allowed to use the ClusterIssuer {} to sign the Certificate {}.",
                user,
                issuer_ref.name,
                certificate.name_any()
            ))
        };
        match self
            .reviewer
            .check_access(
                USE_VERB,
                API_GROUP,
                CLUSTER_ISSUERS_RESOURCE,
                user,
                groups,
            )
            .await
        {
            Ok(true) => Authentication::Allowed,
            Ok(false) => {
                tracing::info!(
                    user,
                    ?groups,
                    cluster_issuer = %issuer_ref.name,
                    "user may not use ClusterIssuer"
                );
                denied()
            }
            Err(error) => {
                tracing::error!(
                    user,
                    cluster_issuer = %issuer_ref.name,
                    error = &error as &dyn std::error::Error,
                    "failed to authorize use of ClusterIssuer, denying request"
                );
                denied()
            }
        }
    }
}
