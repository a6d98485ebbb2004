//! Restarts workloads that mount a Secret after its key pair was rotated.
//!
//! The certificate controller only sends a [`SecretRotated`] message; the restarts happen in a
//! separate task, and their failures are logged without affecting the controller.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::{DaemonSet, Deployment, StatefulSet},
            core::v1::PodTemplateSpec,
        },
        NamespaceResourceScope,
    },
    kube::{
        self,
        api::{ListParams, PostParams},
        Api, Resource, ResourceExt,
    },
};
use strum::{Display, EnumIter, IntoEnumIterator};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Label that is stamped onto workloads (and their Pod templates) to trigger a rolling restart.
pub const LABEL_RESTARTED_AT: &str = "certificates.stackable.tech/restarted-at";

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRotated {
    pub namespace: String,
    pub secret_name: String,
}

/// Sending half of the rotation channel, held by the certificate controller.
#[derive(Clone)]
pub struct RestartNotifier {
    tx: mpsc::Sender<SecretRotated>,
}

impl RestartNotifier {
    pub fn channel() -> (Self, mpsc::Receiver<SecretRotated>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Queues a restart of the workloads mounting the rotated Secret, without waiting for it.
    pub fn secret_rotated(&self, rotated: SecretRotated) {
        if let Err(error) = self.tx.try_send(rotated) {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "dropping workload restart request"
            );
        }
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list {kind}s in namespace {namespace:?}"))]
    ListWorkloads {
        source: kube::Error,
        kind: String,
        namespace: String,
    },
}

/// Workload kinds that are restarted when a Secret they mount is rotated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

#[async_trait]
pub trait WorkloadRestarter: Send + Sync {
    /// Restarts every workload of `kind` mounting the rotated Secret, returning the names of
    /// the restarted workloads.
    async fn restart_kind(
        &self,
        kind: WorkloadKind,
        rotated: &SecretRotated,
        restarted_at: &str,
    ) -> Result<Vec<String>, Error>;
}

/// Restarts the workloads of every kind that mount the rotated Secret.
///
/// A kind that cannot be listed is logged and skipped, the other kinds are still restarted.
pub async fn restart_dependents(
    restarter: &dyn WorkloadRestarter,
    rotated: &SecretRotated,
    restarted_at: &str,
) -> Vec<String> {
    let mut restarted = Vec::new();
    for kind in WorkloadKind::iter() {
        match restarter.restart_kind(kind, rotated, restarted_at).await {
            Ok(names) => restarted.extend(names),
            Err(error) => tracing::warn!(
                namespace = %rotated.namespace,
                secret = %rotated.secret_name,
                %kind,
                error = &error as &dyn std::error::Error,
                "failed to restart workloads after certificate rotation"
            ),
        }
    }
    restarted
}

/// Workload kinds that run Pods from a template.
pub trait PodTemplateOwner {
    fn pod_template(&self) -> Option<&PodTemplateSpec>;
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec>;
}

impl PodTemplateOwner for Deployment {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|spec| &mut spec.template)
    }
}

impl PodTemplateOwner for StatefulSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|spec| &mut spec.template)
    }
}

impl PodTemplateOwner for DaemonSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|spec| &mut spec.template)
    }
}

/// Whether any volume of `template` mounts the Secret `secret_name`, directly or projected.
pub fn mounts_secret(template: &PodTemplateSpec, secret_name: &str) -> bool {
    let volumes = template
        .spec
        .iter()
        .flat_map(|spec| spec.volumes.iter().flatten());
    for volume in volumes {
        if volume
            .secret
            .as_ref()
            .and_then(|secret| secret.secret_name.as_deref())
            == Some(secret_name)
        {
            return true;
        }
        let projected = volume
            .projected
            .iter()
            .flat_map(|projected| projected.sources.iter().flatten())
            .filter_map(|source| source.secret.as_ref());
        for secret in projected {
            if secret.name.as_deref() == Some(secret_name) {
                return true;
            }
        }
    }
    false
}

/// Stamps the restart label onto `workload` and its Pod template if it mounts `secret_name`.
///
/// Returns whether the workload was modified.
pub fn stamp_restart<K: ResourceExt + PodTemplateOwner>(
    workload: &mut K,
    secret_name: &str,
    restarted_at: &str,
) -> bool {
    if !workload
        .pod_template()
        .is_some_and(|template| mounts_secret(template, secret_name))
    {
        return false;
    }
    workload
        .labels_mut()
        .insert(LABEL_RESTARTED_AT.to_string(), restarted_at.to_string());
    if let Some(template) = workload.pod_template_mut() {
        template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(Default::default)
            .insert(LABEL_RESTARTED_AT.to_string(), restarted_at.to_string());
    }
    true
}

/// Label-safe timestamp, such as `20240102T030405Z`.
pub fn restart_timestamp(now: OffsetDateTime) -> String {
    let now = now.to_offset(time::UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

pub struct KubeWorkloadRestarter {
    client: kube::Client,
}

impl KubeWorkloadRestarter {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    async fn restart_workloads<K>(
        &self,
        rotated: &SecretRotated,
        restarted_at: &str,
    ) -> Result<Vec<String>, Error>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + PodTemplateOwner
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
    {
        let api = Api::<K>::namespaced(self.client.clone(), &rotated.namespace);
        let workloads = api
            .list(&ListParams::default())
            .await
            .context(ListWorkloadsSnafu {
                kind: K::kind(&()).to_string(),
                namespace: rotated.namespace.clone(),
            })?;
        let mut restarted = Vec::new();
        for mut workload in workloads {
            if !stamp_restart(&mut workload, &rotated.secret_name, restarted_at) {
                continue;
            }
            let name = workload.name_any();
            match api.replace(&name, &PostParams::default(), &workload).await {
                Ok(_) => restarted.push(format!("{}/{name}", K::kind(&()))),
                Err(error) => tracing::warn!(
                    workload = %name,
                    kind = %K::kind(&()),
                    error = &error as &dyn std::error::Error,
                    "failed to restart workload"
                ),
            }
        }
        Ok(restarted)
    }
}

#[async_trait]
impl WorkloadRestarter for KubeWorkloadRestarter {
    async fn restart_kind(
        &self,
        kind: WorkloadKind,
        rotated: &SecretRotated,
        restarted_at: &str,
    ) -> Result<Vec<String>, Error> {
        match kind {
            WorkloadKind::Deployment => {
                self.restart_workloads::<Deployment>(rotated, restarted_at)
                    .await
            }
            WorkloadKind::StatefulSet => {
                self.restart_workloads::<StatefulSet>(rotated, restarted_at)
                    .await
            }
            WorkloadKind::DaemonSet => {
                self.restart_workloads::<DaemonSet>(rotated, restarted_at)
                    .await
            }
        }
    }
}

/// Processes rotation messages until `shutdown` is cancelled or all senders are gone.
pub async fn run(
    mut rx: mpsc::Receiver<SecretRotated>,
    restarter: &dyn WorkloadRestarter,
    shutdown: CancellationToken,
) {
    loop {
        let rotated = tokio::select! {
            _ = shutdown.cancelled() => break,
            rotated = rx.recv() => match rotated {
                Some(rotated) => rotated,
                None => break,
            },
        };
        let restarted_at = restart_timestamp(OffsetDateTime::now_utc());
        let restarted = restart_dependents(restarter, &rotated, &restarted_at).await;
        if !restarted.is_empty() {
            tracing::info!(
                namespace = %rotated.namespace,
                secret = %rotated.secret_name,
                ?restarted,
                "restarted workloads after certificate rotation"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use stackable_operator::{
        k8s_openapi::api::{
            apps::v1::{Deployment, DeploymentSpec},
            core::v1::{
                PodSpec, PodTemplateSpec, ProjectedVolumeSource, SecretProjection,
                SecretVolumeSource, Volume, VolumeProjection,
            },
        },
        kube::ResourceExt,
    };

    use super::*;
    use crate::test_support::api_error;

    fn deployment(volumes: Vec<Volume>) -> Deployment {
        Deployment {
            metadata: stackable_operator::kube::api::ObjectMeta {
                name: Some("web".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn secret_volume(secret_name: &str) -> Volume {
        Volume {
            name: "tls".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn projected_volume(secret_name: &str) -> Volume {
        Volume {
            name: "tls".to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    secret: Some(SecretProjection {
                        name: Some(secret_name.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn stamps_workloads_mounting_the_secret() {
        for volume in [secret_volume("output"), projected_volume("output")] {
            let mut workload = deployment(vec![volume]);
            assert!(stamp_restart(&mut workload, "output", "20240102T030405Z"));
            assert_eq!(workload.labels()[LABEL_RESTARTED_AT], "20240102T030405Z");
            let template_labels = workload
                .pod_template()
                .and_then(|template| template.metadata.as_ref())
                .and_then(|metadata| metadata.labels.as_ref())
                .unwrap();
            assert_eq!(template_labels[LABEL_RESTARTED_AT], "20240102T030405Z");
        }
    }

    #[test]
    fn ignores_workloads_mounting_other_secrets() {
        let mut workload = deployment(vec![secret_volume("other"), projected_volume("other")]);
        assert!(!stamp_restart(&mut workload, "output", "20240102T030405Z"));
        assert!(workload.labels().is_empty());
    }

    #[test]
    fn timestamp_is_label_safe() {
        let now = OffsetDateTime::from_unix_timestamp(1_704_164_645).unwrap();
        assert_eq!(restart_timestamp(now), "20240102T030405Z");
    }

    /// Restarts one `web` workload of every kind, except for `failing` which cannot be listed.
    #[derive(Default)]
    struct RecordingRestarter {
        failing: Option<WorkloadKind>,
        calls: Mutex<Vec<(WorkloadKind, SecretRotated)>>,
    }

    #[async_trait]
    impl WorkloadRestarter for RecordingRestarter {
        async fn restart_kind(
            &self,
            kind: WorkloadKind,
            rotated: &SecretRotated,
            _restarted_at: &str,
        ) -> Result<Vec<String>, Error> {
            self.calls.lock().unwrap().push((kind, rotated.clone()));
            if self.failing == Some(kind) {
                return Err(Error::ListWorkloads {
                    source: api_error(403, "Forbidden"),
                    kind: kind.to_string(),
                    namespace: rotated.namespace.clone(),
                });
            }
            Ok(vec![format!("{kind}/web")])
        }
    }

    fn rotated() -> SecretRotated {
        SecretRotated {
            namespace: "default".to_string(),
            secret_name: "output".to_string(),
        }
    }

    #[tokio::test]
    async fn list_failures_do_not_skip_other_kinds() {
        for failing in WorkloadKind::iter() {
            let restarter = RecordingRestarter {
                failing: Some(failing),
                ..RecordingRestarter::default()
            };
            let restarted = restart_dependents(&restarter, &rotated(), "20240102T030405Z").await;
            let expected = WorkloadKind::iter()
                .filter(|kind| *kind != failing)
                .map(|kind| format!("{kind}/web"))
                .collect::<Vec<_>>();
            assert_eq!(restarted, expected);
            assert_eq!(restarter.calls.lock().unwrap().len(), 3);
        }
    }

    #[tokio::test]
    async fn notifier_task_handles_every_rotation() {
        let (notifier, rx) = RestartNotifier::channel();
        let restarter = RecordingRestarter::default();
        notifier.secret_rotated(rotated());
        drop(notifier);

        run(rx, &restarter, CancellationToken::new()).await;
        assert_eq!(
            *restarter.calls.lock().unwrap(),
            WorkloadKind::iter()
                .map(|kind| (kind, rotated()))
                .collect::<Vec<_>>()
        );
    }
}
