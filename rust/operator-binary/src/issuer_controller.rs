//! Maintains the `Ready` condition of Issuers and ClusterIssuers.

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::{future, StreamExt};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::chrono,
    kube::{
        self,
        api::DynamicObject,
        runtime::{
            controller::{self, Action},
            reflector::ObjectRef,
            watcher, Controller,
        },
        Api,
    },
    logging::controller::ReconcilerError,
    namespace::WatchNamespace,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tokio_util::sync::CancellationToken;

use crate::{
    client::CertificateClient,
    crd::{
        set_condition, ClusterIssuer, ConditionStatus, GenericIssuer, Issuer, CONDITION_READY,
    },
    issuer::{FromIssuerError, IssuerFactory},
    utils::{error_full_message, offsetdatetime_to_k8s_time, Clock, DateTimeOutOfBoundsError},
    validation, OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "issuer";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

pub const REASON_IS_READY: &str = "IsReady";
pub const REASON_KEY_PAIR_VERIFIED: &str = "KeyPairVerified";
pub const REASON_ERR_GET_KEY_PAIR: &str = "ErrGetKeyPair";
pub const REASON_UNSUPPORTED: &str = "Unsupported";
pub const REASON_BAD_CONFIG: &str = "BadConfig";

/// CA Secrets are not watched, so CA issuers are re-checked periodically.
const CA_RECHECK_INTERVAL: Duration = Duration::from_secs(60);
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(5);

pub struct Ctx {
    pub client: Arc<dyn CertificateClient>,
    pub issuers: Arc<dyn IssuerFactory>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("current time cannot be represented"))]
    InvalidTimestamp { source: DateTimeOutOfBoundsError },

    #[snafu(display("failed to update status of {issuer}"))]
    UpdateStatus {
        source: kube::Error,
        issuer: ObjectRef<DynamicObject>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::InvalidTimestamp { .. } => None,
            Error::UpdateStatus { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub status: ConditionStatus,
    pub reason: &'static str,
    pub message: String,
}

/// Works out whether `issuer` can currently sign certificates.
pub async fn readiness(issuers: &dyn IssuerFactory, issuer: &GenericIssuer) -> Readiness {
    let config = issuer.config();
    if let Some(errors) = validation::aggregate(&validation::validate_issuer_config(config)) {
        return Readiness {
            status: ConditionStatus::False,
            reason: REASON_BAD_CONFIG,
            message: format!("Resource validation failed: {errors}"),
        };
    }
    match issuers.backend_for(issuer).await {
        Ok(_) if config.ca.is_some() => Readiness {
            status: ConditionStatus::True,
            reason: REASON_KEY_PAIR_VERIFIED,
            message: "Signing CA verified".to_string(),
        },
        Ok(_) => Readiness {
            status: ConditionStatus::True,
            reason: REASON_IS_READY,
            message: String::new(),
        },
        Err(error @ FromIssuerError::Ca { .. }) => Readiness {
            status: ConditionStatus::False,
            reason: REASON_ERR_GET_KEY_PAIR,
            message: format!(
                "Error getting keypair for CA issuer: {}",
                error_full_message(&error)
            ),
        },
        Err(error @ FromIssuerError::AcmeUnsupported) => Readiness {
            status: ConditionStatus::False,
            reason: REASON_UNSUPPORTED,
            message: error.to_string(),
        },
        Err(error @ FromIssuerError::NoBackend) => Readiness {
            status: ConditionStatus::False,
            reason: REASON_BAD_CONFIG,
            message: error.to_string(),
        },
    }
}

fn issuer_ref(issuer: &GenericIssuer) -> ObjectRef<DynamicObject> {
    match issuer {
        GenericIssuer::Issuer(issuer) => ObjectRef::from_obj(issuer).erase(),
        GenericIssuer::ClusterIssuer(issuer) => ObjectRef::from_obj(issuer).erase(),
    }
}

/// Updates the `Ready` condition of `issuer`, writing the status only if it changed.
#[tracing::instrument(skip(ctx, issuer), fields(object = %issuer_ref(&issuer)))]
pub async fn sync(ctx: &Ctx, mut issuer: GenericIssuer) -> Result<Action> {
    let now = offsetdatetime_to_k8s_time(ctx.clock.now())
        .context(InvalidTimestampSnafu)?
        .0;
    let readiness = readiness(ctx.issuers.as_ref(), &issuer).await;
    tracing::debug!(?readiness, "computed issuer readiness");

    let original = issuer.status().cloned();
    set_ready(&mut issuer, &readiness, now);
    if issuer.status() != original.as_ref() {
        ctx.client
            .replace_issuer_status(&issuer)
            .await
            .context(UpdateStatusSnafu {
                issuer: issuer_ref(&issuer),
            })?;
        tracing::info!(
            status = %readiness.status,
            reason = readiness.reason,
            "updated issuer readiness"
        );
    }

    Ok(if issuer.config().ca.is_some() {
        Action::requeue(CA_RECHECK_INTERVAL)
    } else {
        Action::await_change()
    })
}

fn set_ready(issuer: &mut GenericIssuer, readiness: &Readiness, now: chrono::DateTime<chrono::Utc>) {
    set_condition(
        &mut issuer.status_mut().conditions,
        CONDITION_READY,
        readiness.status,
        readiness.reason,
        readiness.message.clone(),
        now,
    );
}

async fn reconcile_issuer(issuer: Arc<Issuer>, ctx: Arc<Ctx>) -> Result<Action> {
    sync(&ctx, GenericIssuer::Issuer(issuer.as_ref().clone())).await
}

async fn reconcile_cluster_issuer(issuer: Arc<ClusterIssuer>, ctx: Arc<Ctx>) -> Result<Action> {
    sync(&ctx, GenericIssuer::ClusterIssuer(issuer.as_ref().clone())).await
}

fn error_policy<K>(_obj: Arc<K>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

fn report_reconciled<K>(
    result: Result<(ObjectRef<K>, Action), controller::Error<Error, watcher::Error>>,
) where
    K: kube::Resource<DynamicType = ()>,
{
    match result {
        Ok((issuer, _)) => {
            tracing::debug!(controller.name = FULL_CONTROLLER_NAME, %issuer, "reconciled issuer");
        }
        Err(controller::Error::ReconcilerFailed(error, issuer)) => {
            tracing::error!(
                controller.name = FULL_CONTROLLER_NAME,
                %issuer,
                error.category = error.category(),
                error = &error as &dyn std::error::Error,
                "failed to reconcile issuer"
            );
        }
        Err(error) => {
            tracing::error!(
                controller.name = FULL_CONTROLLER_NAME,
                error = &error as &dyn std::error::Error,
                "issuer controller failed"
            );
        }
    }
}

/// Runs the Issuer and ClusterIssuer controllers until `shutdown` is cancelled.
pub async fn start(
    client: &stackable_operator::client::Client,
    watch_namespace: &WatchNamespace,
    ctx: Arc<Ctx>,
    shutdown: CancellationToken,
) {
    let issuers = Controller::new(
        watch_namespace.get_api::<Issuer>(client),
        watcher::Config::default(),
    )
        .graceful_shutdown_on(shutdown.clone().cancelled_owned())
        .run(reconcile_issuer, error_policy, ctx.clone())
        .for_each(|result| {
            report_reconciled(result);
            future::ready(())
        });
    let cluster_issuers = Controller::new(
        Api::<ClusterIssuer>::all(client.as_kube_client()),
        watcher::Config::default(),
    )
    .graceful_shutdown_on(shutdown.cancelled_owned())
    .run(reconcile_cluster_issuer, error_policy, ctx)
    .for_each(|result| {
        report_reconciled(result);
        future::ready(())
    });
    future::join(issuers, cluster_issuers).await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use stackable_operator::kube::api::ObjectMeta;
    use time::OffsetDateTime;

    use super::*;
    use crate::{
        crd::{
            find_condition, AcmeIssuer, CaIssuer, ClusterIssuerSpec, IssuerConfig, IssuerSpec,
            SelfSignedIssuer,
        },
        issuer::KubeIssuerFactory,
        test_support::{
            self_signed_pem, tls_secret, FakeCertificateClient, FakeIssuerFactory,
            FakeSecretStore, FixedClock,
        },
    };

    fn issuer(namespace: &str, config: IssuerConfig) -> Issuer {
        let mut issuer = Issuer::new("test", IssuerSpec { config });
        issuer.metadata.namespace = Some(namespace.to_string());
        issuer
    }

    fn ca_config() -> IssuerConfig {
        IssuerConfig {
            ca: Some(CaIssuer {
                secret_name: "ca".to_string(),
            }),
            ..IssuerConfig::default()
        }
    }

    fn ca_secret(namespace: &str) -> stackable_operator::k8s_openapi::api::core::v1::Secret {
        let spec = crate::crd::CertificateSpec {
            secret_name: "ca".to_string(),
            common_name: Some("Test CA".to_string()),
            is_ca: true,
            key_algorithm: Some(crate::crd::KeyAlgorithm::Ecdsa),
            ..crate::crd::CertificateSpec::default()
        };
        tls_secret(namespace, "ca", &self_signed_pem(&spec))
    }

    fn kube_factory(secrets: Arc<FakeSecretStore>) -> KubeIssuerFactory {
        KubeIssuerFactory::new(secrets, "operators")
    }

    fn ctx(client: Arc<FakeCertificateClient>, issuers: Arc<dyn IssuerFactory>) -> Ctx {
        Ctx {
            client,
            issuers,
            clock: Arc::new(FixedClock::new(
                OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            )),
        }
    }

    #[tokio::test]
    async fn self_signed_issuers_are_ready() {
        let issuer = GenericIssuer::Issuer(issuer(
            "default",
            IssuerConfig {
                self_signed: Some(SelfSignedIssuer {}),
                ..IssuerConfig::default()
            },
        ));
        let state = readiness(&FakeIssuerFactory::default(), &issuer).await;
        assert_eq!(state.status, ConditionStatus::True);
        assert_eq!(state.reason, REASON_IS_READY);
    }

    #[tokio::test]
    async fn ca_issuers_need_their_key_pair() {
        let secrets = Arc::new(FakeSecretStore::default());
        let factory = kube_factory(secrets.clone());
        let issuer = GenericIssuer::Issuer(issuer("default", ca_config()));

        let state = readiness(&factory, &issuer).await;
        assert_eq!(state.status, ConditionStatus::False);
        assert_eq!(state.reason, REASON_ERR_GET_KEY_PAIR);
        assert!(
            state.message.starts_with("Error getting keypair for CA issuer: "),
            "{}",
            state.message
        );
        assert!(state.message.contains("does not exist"), "{}", state.message);

        secrets.insert(ca_secret("default"));
        let state = readiness(&factory, &issuer).await;
        assert_eq!(state.status, ConditionStatus::True);
        assert_eq!(state.reason, REASON_KEY_PAIR_VERIFIED);
    }

    #[tokio::test]
    async fn cluster_issuers_read_their_ca_from_the_cluster_resource_namespace() {
        let secrets = Arc::new(FakeSecretStore::default());
        secrets.insert(ca_secret("operators"));
        let issuer = GenericIssuer::ClusterIssuer(ClusterIssuer {
            metadata: ObjectMeta {
                name: Some("shared".to_string()),
                ..ObjectMeta::default()
            },
            spec: ClusterIssuerSpec { config: ca_config() },
            status: None,
        });
        let state = readiness(&kube_factory(secrets), &issuer).await;
        assert_eq!(state.reason, REASON_KEY_PAIR_VERIFIED);
    }

    #[tokio::test]
    async fn acme_issuers_are_unsupported() {
        let issuer = GenericIssuer::Issuer(issuer(
            "default",
            IssuerConfig {
                acme: Some(AcmeIssuer {
                    server: "https://acme.example.com/directory".to_string(),
                    email: "ops@example.com".to_string(),
                    private_key_secret_ref: crate::crd::LocalObjectReference {
                        name: "acme-account".to_string(),
                    },
                }),
                ..IssuerConfig::default()
            },
        ));
        let state = readiness(
            &kube_factory(Arc::new(FakeSecretStore::default())),
            &issuer,
        )
        .await;
        assert_eq!(state.status, ConditionStatus::False);
        assert_eq!(state.reason, REASON_UNSUPPORTED);
    }

    #[tokio::test]
    async fn issuers_with_several_backends_are_misconfigured() {
        let mut config = ca_config();
        config.self_signed = Some(SelfSignedIssuer {});
        let issuer = GenericIssuer::Issuer(issuer("default", config));
        let state = readiness(&FakeIssuerFactory::default(), &issuer).await;
        assert_eq!(state.reason, REASON_BAD_CONFIG);
        assert!(state.message.starts_with("Resource validation failed: "));
    }

    #[tokio::test]
    async fn status_is_only_written_on_change() {
        let client = Arc::new(FakeCertificateClient::default());
        let factory = Arc::new(FakeIssuerFactory::default());
        let stored = issuer(
            "default",
            IssuerConfig {
                self_signed: Some(SelfSignedIssuer {}),
                ..IssuerConfig::default()
            },
        );
        client.add_issuer(stored.clone());
        let ctx = ctx(client.clone(), factory.clone());

        let action = sync(&ctx, GenericIssuer::Issuer(stored)).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(client.issuer_status_writes(), 1);
        let updated = client.issuer("default", "test").unwrap();
        let ready = find_condition(&updated.status.as_ref().unwrap().conditions, CONDITION_READY)
            .unwrap()
            .clone();
        assert_eq!(ready.status, ConditionStatus::True);

        sync(&ctx, GenericIssuer::Issuer(updated.clone())).await.unwrap();
        assert_eq!(client.issuer_status_writes(), 1);

        factory.fail_init.store(true, Ordering::SeqCst);
        sync(&ctx, GenericIssuer::Issuer(updated)).await.unwrap();
        assert_eq!(client.issuer_status_writes(), 2);
        assert!(!GenericIssuer::Issuer(client.issuer("default", "test").unwrap()).is_ready());
    }

    #[tokio::test]
    async fn failed_status_writes_are_reported() {
        let client = Arc::new(FakeCertificateClient::default());
        client.fail_status_writes.store(true, Ordering::SeqCst);
        let stored = issuer("default", ca_config());
        client.add_issuer(stored.clone());
        let ctx = ctx(client, Arc::new(FakeIssuerFactory::default()));

        let err = sync(&ctx, GenericIssuer::Issuer(stored)).await.unwrap_err();
        assert_eq!(err.category(), "UpdateStatus");
    }
}
