//! Kubernetes Events describing the outcome of reconciliation passes.
//!
//! Recording is fire-and-forget: a failure to publish an Event is logged and never fails
//! the pass that produced it.

use async_trait::async_trait;
use stackable_operator::{
    k8s_openapi::api::core::v1::ObjectReference,
    kube::{
        self,
        runtime::events::{self, Recorder, Reporter},
    },
};
use strum::{Display, IntoStaticStr};

/// The `action` of every published Event.
const RECONCILE_ACTION: &str = "Reconcile";

pub mod reasons {
    pub const BAD_CONFIG: &str = "BadConfig";
    pub const DUPLICATE_SECRET_NAME: &str = "DuplicateSecretName";
    pub const ISSUER_NOT_FOUND: &str = "IssuerNotFound";
    pub const ISSUER_NOT_READY: &str = "IssuerNotReady";
    pub const ISSUER_INIT_ERROR: &str = "IssuerInitError";
    pub const ISSUE_FAILED: &str = "IssueFailed";
    pub const SAVE_CERT_ERROR: &str = "SaveCertError";
    pub const CERT_ISSUED: &str = "CertIssued";
    pub const CERT_RENEWED: &str = "CertRenewed";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, IntoStaticStr)]
pub enum EventType {
    Normal,
    Warning,
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    );
}

impl From<EventType> for events::EventType {
    fn from(type_: EventType) -> Self {
        match type_ {
            EventType::Normal => events::EventType::Normal,
            EventType::Warning => events::EventType::Warning,
        }
    }
}

fn build_event(type_: EventType, reason: &str, message: &str) -> events::Event {
    events::Event {
        type_: type_.into(),
        reason: reason.to_string(),
        note: Some(message.to_string()),
        action: RECONCILE_ACTION.to_string(),
        secondary: None,
    }
}

/// Publishes Events through a kube [`Recorder`], reported as coming from `controller`.
pub struct KubeEventRecorder {
    client: kube::Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: kube::Client, controller: impl Into<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.into(),
                instance: None,
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.clone());
        if let Err(error) = recorder.publish(build_event(type_, reason, message)).await {
            tracing::warn!(
                reason,
                object.name = object.name.as_deref(),
                error = &error as &dyn std::error::Error,
                "failed to publish event"
            );
        }
    }
}
