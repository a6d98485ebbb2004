//! Reconciles Certificates into `kubernetes.io/tls` Secrets and keeps them renewed.

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::{stream, StreamExt, TryStreamExt};
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, chrono},
    kube::{
        self,
        api::{DynamicObject, PartialObjectMeta},
        runtime::{
            metadata_watcher,
            reflector::{self, ObjectRef},
            watcher, WatchStreamExt,
        },
        Api, Resource, ResourceExt,
    },
    logging::controller::ReconcilerError,
    namespace::WatchNamespace,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::{
    client::CertificateClient,
    crd::{
        find_condition, set_condition, Certificate, ClusterIssuer, ConditionStatus, GenericIssuer,
        Issuer, API_GROUP, CLUSTER_ISSUER_KIND, CONDITION_READY, ISSUER_KIND,
    },
    events::{reasons, EventRecorder, EventType},
    issuer::{IssuerBackendError, IssuerFactory},
    pki,
    restart::{RestartNotifier, SecretRotated},
    scheduler::Scheduler,
    secret::{self, SecretStore, SecretWrite},
    utils::{
        asn1time_to_offsetdatetime, error_full_message, offsetdatetime_to_k8s_time, Clock,
        DateTimeOutOfBoundsError,
    },
    validation, work_queue::WorkQueue, OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "certificate";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

pub const REASON_NOT_FOUND: &str = "NotFound";
pub const REASON_DOES_NOT_MATCH: &str = "DoesNotMatch";
pub const REASON_EXPIRED: &str = "Expired";
pub const REASON_READY: &str = "Ready";

/// Which Certificates are compared when looking for a conflicting `secretName`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DuplicateSecretNameScope {
    #[default]
    Namespace,
    Cluster,
}

#[derive(Clone, Debug)]
pub struct Options {
    /// Fraction of the validity that is used as `renewBefore` when none is configured.
    pub renew_before_ratio: f64,
    pub duplicate_secret_name_scope: DuplicateSecretNameScope,
    pub enable_certificate_owner_ref: bool,
    pub issue_timeout: Duration,
    pub issue_retry_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            renew_before_ratio: 1.0 / 3.0,
            duplicate_secret_name_scope: DuplicateSecretNameScope::Namespace,
            enable_certificate_owner_ref: false,
            issue_timeout: Duration::from_secs(5 * 60),
            issue_retry_delay: Duration::from_secs(60),
        }
    }
}

pub type CertificateKey = ObjectRef<Certificate>;

pub struct Ctx {
    pub client: Arc<dyn CertificateClient>,
    pub secrets: Arc<dyn SecretStore>,
    pub issuers: Arc<dyn IssuerFactory>,
    pub recorder: Arc<dyn EventRecorder>,
    /// Renewals and retries, one pending trigger per Certificate.
    pub scheduler: Arc<Scheduler<CertificateKey>>,
    pub notifier: RestartNotifier,
    pub clock: Arc<dyn Clock>,
    pub options: Options,
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("{certificate} has no namespace"))]
    NoNamespace { certificate: CertificateKey },

    #[snafu(display("failed to get {certificate}"))]
    GetCertificate {
        source: kube::Error,
        certificate: CertificateKey,
    },

    #[snafu(display("failed to load key pair from {secret}"))]
    LoadKeyPair {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to get {issuer}"))]
    GetIssuer {
        source: kube::Error,
        issuer: ObjectRef<DynamicObject>,
    },

    #[snafu(display("current time cannot be represented"))]
    InvalidTimestamp { source: DateTimeOutOfBoundsError },

    #[snafu(display("failed to save issued key pair"))]
    SaveKeyPair { source: secret::Error },

    #[snafu(display("failed to update status of {certificate}"))]
    UpdateStatus {
        source: kube::Error,
        certificate: CertificateKey,
    },

    #[snafu(display("failed to update status of {certificate} after the pass failed: {pass}"))]
    UpdateStatusAfterFailure {
        source: kube::Error,
        certificate: CertificateKey,
        pass: Box<Error>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::NoNamespace { .. } => None,
            Error::GetCertificate { .. } => None,
            Error::LoadKeyPair { secret, .. } => Some(secret.clone().erase()),
            Error::GetIssuer { issuer, .. } => Some(issuer.clone()),
            Error::InvalidTimestamp { .. } => None,
            Error::SaveKeyPair { .. } => None,
            Error::UpdateStatus { .. } => None,
            Error::UpdateStatusAfterFailure { pass, .. } => pass.secondary_object(),
        }
    }
}

/// The key pair currently stored in a Certificate's Secret.
struct LiveKeyPair {
    key: PKey<Private>,
    cert: X509,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl LiveKeyPair {
    fn from_secret(secret: &Secret) -> Option<Self> {
        let (key, cert) = secret::parse_key_pair(secret)?;
        let not_before = asn1time_to_offsetdatetime(cert.not_before()).ok()?;
        let not_after = asn1time_to_offsetdatetime(cert.not_after()).ok()?;
        Some(Self {
            key,
            cert,
            not_before,
            not_after,
        })
    }
}

/// How long before `not_after` a certificate valid from `not_before` should be renewed.
///
/// A configured `renew_before` that is not shorter than the validity falls back to `ratio`.
pub fn renew_before(
    configured: Option<Duration>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    ratio: f64,
) -> Duration {
    let validity = Duration::try_from(not_after - not_before).unwrap_or_default();
    match configured {
        Some(renew_before) if renew_before < validity => renew_before,
        _ => Duration::try_from_secs_f64(validity.as_secs_f64() * ratio).unwrap_or_default(),
    }
}

pub fn renewal_time(
    configured: Option<Duration>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    ratio: f64,
) -> OffsetDateTime {
    not_after - renew_before(configured, not_before, not_after, ratio)
}

/// How long to wait from `now` until `at`, firing immediately if `at` has already passed.
fn delay_until(at: OffsetDateTime, now: OffsetDateTime) -> Duration {
    Duration::try_from(at - now).unwrap_or_default()
}

fn chrono_now(now: OffsetDateTime) -> Result<chrono::DateTime<chrono::Utc>> {
    Ok(offsetdatetime_to_k8s_time(now)
        .context(InvalidTimestampSnafu)?
        .0)
}

fn set_ready(
    certificate: &mut Certificate,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    now: chrono::DateTime<chrono::Utc>,
) {
    let conditions = &mut certificate.status.get_or_insert_with(Default::default).conditions;
    set_condition(conditions, CONDITION_READY, status, reason, message, now);
}

/// Ends the pass on a problem that retrying will not fix, mirroring it in the Ready condition.
///
/// The Warning event is only published when the Ready condition changes.
async fn report_terminal(
    ctx: &Ctx,
    certificate: &mut Certificate,
    reason: &str,
    event_message: &str,
    condition_message: impl Into<String>,
    now: chrono::DateTime<chrono::Utc>,
) {
    let condition_message = condition_message.into();
    let already_reported = certificate
        .status
        .as_ref()
        .and_then(|status| find_condition(&status.conditions, CONDITION_READY))
        .is_some_and(|ready| {
            ready.status == ConditionStatus::False
                && ready.reason == reason
                && ready.message == condition_message
        });
    if already_reported {
        tracing::debug!(reason, "problem was already reported");
    } else {
        ctx.recorder
            .record(
                &certificate.object_ref(&()),
                EventType::Warning,
                reason,
                event_message,
            )
            .await;
    }
    set_ready(certificate, ConditionStatus::False, reason, condition_message, now);
}

/// Outcome of looking up the issuer referenced by a Certificate.
enum IssuerLookup {
    Found(GenericIssuer),
    NotFound(String),
}

/// Runs one reconciliation pass for the Certificate identified by `key`.
///
/// The status is recomputed on a working copy and written back once, only if it changed.
/// Configuration problems end the pass successfully after being reported, transient failures
/// are returned so that the pass is retried.
#[tracing::instrument(skip(ctx, key), fields(certificate = %key))]
pub async fn sync(ctx: &Ctx, key: &CertificateKey) -> Result<()> {
    let namespace = key.namespace.as_deref().context(NoNamespaceSnafu {
        certificate: key.clone(),
    })?;
    let Some(original) = ctx
        .client
        .get_certificate(namespace, &key.name)
        .await
        .context(GetCertificateSnafu {
            certificate: key.clone(),
        })?
    else {
        tracing::debug!("Certificate is gone, dropping pending renewal");
        ctx.scheduler.cancel(key);
        return Ok(());
    };

    let mut certificate = original.clone();
    let result = reconcile(ctx, key, namespace, &mut certificate).await;

    if certificate.status == original.status {
        return result;
    }
    let write = ctx
        .client
        .replace_certificate_status(&certificate)
        .await;
    match (result, write) {
        (result, Ok(())) => result,
        (Ok(()), Err(source)) => Err(Error::UpdateStatus {
            source,
            certificate: key.clone(),
        }),
        (Err(pass), Err(source)) => Err(Error::UpdateStatusAfterFailure {
            source,
            certificate: key.clone(),
            pass: Box::new(pass),
        }),
    }
}

async fn reconcile(
    ctx: &Ctx,
    key: &CertificateKey,
    namespace: &str,
    certificate: &mut Certificate,
) -> Result<()> {
    let now = ctx.clock.now();
    let k8s_now = chrono_now(now)?;
    let object_ref = certificate.object_ref(&());
    let spec = certificate.spec.clone();

    let secret_ref = ObjectRef::<Secret>::new(&spec.secret_name).within(namespace);
    let live = ctx
        .secrets
        .get(namespace, &spec.secret_name)
        .await
        .context(LoadKeyPairSnafu { secret: secret_ref })?
        .as_ref()
        .and_then(LiveKeyPair::from_secret);
    let not_after = live
        .as_ref()
        .map(|live| offsetdatetime_to_k8s_time(live.not_after))
        .transpose()
        .context(InvalidTimestampSnafu)?;
    certificate
        .status
        .get_or_insert_with(Default::default)
        .not_after = not_after;

    if let Some(errors) = validation::aggregate(&validation::validate_certificate(&spec)) {
        let message = format!("Resource validation failed: {errors}");
        report_terminal(ctx, certificate, reasons::BAD_CONFIG, &message, message.clone(), k8s_now)
            .await;
        return Ok(());
    }

    if let Some(owner) = secret_name_owner(ctx, certificate) {
        let message = format!(
            "Another Certificate {owner} already specifies spec.secretName {secret}, please update the secretName on either Certificate",
            secret = spec.secret_name,
        );
        report_terminal(
            ctx,
            certificate,
            reasons::DUPLICATE_SECRET_NAME,
            &message,
            "Another Certificate is using the same secretName",
            k8s_now,
        )
        .await;
        return Ok(());
    }

    let issuer = match lookup_issuer(ctx, certificate, namespace).await? {
        IssuerLookup::Found(issuer) => issuer,
        IssuerLookup::NotFound(message) => {
            report_terminal(
                ctx,
                certificate,
                reasons::ISSUER_NOT_FOUND,
                &message,
                message.clone(),
                k8s_now,
            )
            .await;
            return Ok(());
        }
    };

    if let Some(errors) =
        validation::aggregate(&validation::validate_certificate_for_issuer(&spec, &issuer))
    {
        let message = format!("Resource validation failed: {errors}");
        report_terminal(ctx, certificate, reasons::BAD_CONFIG, &message, message.clone(), k8s_now)
            .await;
        return Ok(());
    }

    if !issuer.is_ready() {
        let message = format!("{} {} not ready", issuer.kind(), issuer.name());
        report_terminal(
            ctx,
            certificate,
            reasons::ISSUER_NOT_READY,
            &message,
            message.clone(),
            k8s_now,
        )
        .await;
        return Ok(());
    }

    let backend = match ctx.issuers.backend_for(&issuer).await {
        Ok(backend) => backend,
        Err(error) => {
            tracing::warn!(
                issuer = %issuer.name(),
                secondary_object = error.secondary_object().map(|obj| obj.to_string()),
                error = &error as &dyn std::error::Error,
                "failed to initialize issuer backend"
            );
            let message = format!(
                "Internal error initialising issuer: {}",
                error_full_message(&error)
            );
            report_terminal(
                ctx,
                certificate,
                reasons::ISSUER_INIT_ERROR,
                &message,
                message.clone(),
                k8s_now,
            )
            .await;
            return Ok(());
        }
    };

    let needs_issue = match &live {
        None => {
            set_ready(
                certificate,
                ConditionStatus::False,
                REASON_NOT_FOUND,
                "Certificate does not exist",
                k8s_now,
            );
            tracing::debug!("issuing, no key pair exists yet");
            true
        }
        Some(live) => {
            let (matches, mut reasons) = pki::matches(&spec, &live.key, &live.cert);
            let mut reason = REASON_READY;
            if live.not_after < now {
                reason = REASON_EXPIRED;
                reasons.push("Certificate has expired".to_string());
            }
            if !matches {
                reason = REASON_DOES_NOT_MATCH;
            }
            if reasons.is_empty() {
                set_ready(
                    certificate,
                    ConditionStatus::True,
                    reason,
                    "Certificate is up to date and has not expired",
                    k8s_now,
                );
            } else {
                set_ready(
                    certificate,
                    ConditionStatus::False,
                    reason,
                    reasons.join(", "),
                    k8s_now,
                );
            }

            let renew_at = renewal_time(
                spec.renew_before.map(|d| *d),
                live.not_before,
                live.not_after,
                ctx.options.renew_before_ratio,
            );
            if !matches {
                tracing::debug!(?reasons, "issuing, key pair does not match");
                true
            } else if now >= renew_at {
                tracing::debug!(%renew_at, "issuing, renewal is due");
                true
            } else {
                let delay = delay_until(renew_at, now);
                ctx.scheduler.add(key.clone(), delay);
                tracing::info!(?delay, %renew_at, "Certificate scheduled for renewal");
                false
            }
        }
    };
    if !needs_issue {
        return Ok(());
    }

    let response = match tokio::time::timeout(
        ctx.options.issue_timeout,
        backend.issue(certificate),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                retry_in = ?ctx.options.issue_retry_delay,
                "failed to issue certificate"
            );
            let message = format!("Error issuing certificate: {}", error_full_message(&error));
            issue_failed(ctx, key, &object_ref, &message).await;
            return Ok(());
        }
        Err(_) => {
            let message = format!(
                "Error issuing certificate: issuer did not respond within {:?}",
                ctx.options.issue_timeout
            );
            tracing::warn!(retry_in = ?ctx.options.issue_retry_delay, "{message}");
            issue_failed(ctx, key, &object_ref, &message).await;
            return Ok(());
        }
    };
    let Some(pem) = response else {
        tracing::debug!("issuer deferred, waiting for the next pass");
        return Ok(());
    };

    let write = match secret::update_secret(
        ctx.secrets.as_ref(),
        certificate,
        namespace,
        &pem,
        ctx.options.enable_certificate_owner_ref,
    )
    .await
    {
        Ok(write) => write,
        Err(error) => {
            let message = format!(
                "Error saving TLS certificate: {}",
                error_full_message(&error)
            );
            ctx.recorder
                .record(
                    &object_ref,
                    EventType::Warning,
                    reasons::SAVE_CERT_ERROR,
                    &message,
                )
                .await;
            return Err(error).context(SaveKeyPairSnafu);
        }
    };
    tracing::info!(?write, "stored issued key pair");
    if pem.certificate.is_empty() {
        return Ok(());
    }

    if write == SecretWrite::Updated {
        ctx.notifier.secret_rotated(SecretRotated {
            namespace: namespace.to_string(),
            secret_name: spec.secret_name.clone(),
        });
    }
    let (reason, message) = if live.is_some() {
        (reasons::CERT_RENEWED, "Certificate renewed successfully")
    } else {
        (reasons::CERT_ISSUED, "Certificate issued successfully")
    };
    ctx.recorder
        .record(&object_ref, EventType::Normal, reason, message)
        .await;

    // update_secret has already validated the certificate
    if let Ok(issued) = pki::decode_first_certificate(&pem.certificate) {
        if let (Ok(not_before), Ok(not_after)) = (
            asn1time_to_offsetdatetime(issued.not_before()),
            asn1time_to_offsetdatetime(issued.not_after()),
        ) {
            let renew_at = renewal_time(
                spec.renew_before.map(|d| *d),
                not_before,
                not_after,
                ctx.options.renew_before_ratio,
            );
            let delay = delay_until(renew_at, now);
            ctx.scheduler.add(key.clone(), delay);
            tracing::info!(?delay, %renew_at, "Certificate scheduled for renewal");
        }
    }
    Ok(())
}

async fn issue_failed(
    ctx: &Ctx,
    key: &CertificateKey,
    object_ref: &stackable_operator::k8s_openapi::api::core::v1::ObjectReference,
    message: &str,
) {
    ctx.recorder
        .record(object_ref, EventType::Warning, reasons::ISSUE_FAILED, message)
        .await;
    ctx.scheduler
        .add(key.clone(), ctx.options.issue_retry_delay);
}

/// Returns the Certificate that owns the Secret of `certificate`, if that is not `certificate`
/// itself.
///
/// The oldest Certificate (by creation time, then namespace and name) owns the Secret.
fn secret_name_owner(ctx: &Ctx, certificate: &Certificate) -> Option<CertificateKey> {
    let candidates = ctx
        .client
        .tracked_certificates()
        .into_iter()
        .filter(|candidate| match ctx.options.duplicate_secret_name_scope {
            DuplicateSecretNameScope::Namespace => {
                candidate.metadata.namespace == certificate.metadata.namespace
            }
            DuplicateSecretNameScope::Cluster => true,
        })
        .collect::<Vec<_>>();
    let this = ObjectRef::from_obj(certificate);
    oldest_with_secret_name(&candidates, certificate)
        .map(ObjectRef::from_obj)
        .filter(|owner| *owner != this)
}

fn ownership_order(certificate: &Certificate) -> impl Ord {
    (
        certificate.metadata.creation_timestamp.clone().map(|time| time.0),
        certificate.namespace(),
        certificate.name_any(),
    )
}

/// The oldest Certificate among `candidates` and `certificate` that uses the same Secret.
fn oldest_with_secret_name<'a>(
    candidates: &'a [Arc<Certificate>],
    certificate: &'a Certificate,
) -> Option<&'a Certificate> {
    candidates
        .iter()
        .map(|candidate| candidate.as_ref())
        .filter(|candidate| candidate.spec.secret_name == certificate.spec.secret_name)
        .chain(std::iter::once(certificate))
        .min_by_key(|candidate| ownership_order(candidate))
}

async fn lookup_issuer(
    ctx: &Ctx,
    certificate: &Certificate,
    namespace: &str,
) -> Result<IssuerLookup> {
    let issuer_ref = &certificate.spec.issuer_ref;
    let kind = issuer_ref.kind();
    let not_found = || Ok(IssuerLookup::NotFound(format!("{kind} {} not found", issuer_ref.name)));
    if issuer_ref
        .group
        .as_deref()
        .is_some_and(|group| !group.is_empty() && group != API_GROUP)
    {
        return not_found();
    }
    let issuer = match kind {
        ISSUER_KIND => ctx
            .client
            .get_issuer(namespace, &issuer_ref.name)
            .await
            .context(GetIssuerSnafu {
                issuer: ObjectRef::<Issuer>::new(&issuer_ref.name)
                    .within(namespace)
                    .erase(),
            })?
            .map(GenericIssuer::Issuer),
        CLUSTER_ISSUER_KIND => ctx
            .client
            .get_cluster_issuer(&issuer_ref.name)
            .await
            .context(GetIssuerSnafu {
                issuer: ObjectRef::<ClusterIssuer>::new(&issuer_ref.name).erase(),
            })?
            .map(GenericIssuer::ClusterIssuer),
        _ => None,
    };
    match issuer {
        Some(issuer) => Ok(IssuerLookup::Found(issuer)),
        None => not_found(),
    }
}

/// The Certificates (among `certificates`) that store their key pair in the given Secret.
pub fn certificates_for_secret(
    certificates: &[Arc<Certificate>],
    namespace: Option<&str>,
    name: &str,
) -> Vec<CertificateKey> {
    certificates
        .iter()
        .filter(|cert| cert.metadata.namespace.as_deref() == namespace && cert.spec.secret_name == name)
        .map(|cert| ObjectRef::from_obj(cert.as_ref()))
        .collect()
}

/// The Certificates (among `certificates`) that reference `issuer`.
pub fn certificates_for_issuer(
    certificates: &[Arc<Certificate>],
    issuer: &GenericIssuer,
) -> Vec<CertificateKey> {
    let issuer_name = issuer.name();
    let issuer_namespace = issuer.namespace();
    certificates
        .iter()
        .filter(|cert| {
            let issuer_ref = &cert.spec.issuer_ref;
            issuer_ref.name == issuer_name
                && issuer_ref.kind() == issuer.kind()
                && (issuer_namespace.is_none() || cert.metadata.namespace == issuer_namespace)
        })
        .map(|cert| ObjectRef::from_obj(cert.as_ref()))
        .collect()
}

/// Watches Certificates and everything they depend on, and reconciles them with `workers`
/// concurrent workers until `shutdown` is cancelled.
///
/// The watched Certificates are cached in `certificates_writer`.
pub async fn start(
    client: &stackable_operator::client::Client,
    watch_namespace: &WatchNamespace,
    certificates_writer: reflector::store::Writer<Certificate>,
    ctx: Arc<Ctx>,
    workers: usize,
    shutdown: CancellationToken,
) {
    let queue = Arc::new(WorkQueue::<CertificateKey>::new());
    let certificates = certificates_writer.as_reader();

    let certificate_triggers = watcher(
        watch_namespace.get_api::<Certificate>(client),
        watcher::Config::default(),
    )
    .default_backoff()
    .reflect(certificates_writer)
    .touched_objects()
    .map_ok(|certificate| vec![ObjectRef::from_obj(&certificate)]);

    let secret_triggers = metadata_watcher(
        watch_namespace.get_api::<Secret>(client),
        watcher::Config::default(),
    )
    .default_backoff()
    .touched_objects()
    .map_ok({
        let certificates = certificates.clone();
        move |secret: PartialObjectMeta<Secret>| {
            certificates_for_secret(
                &certificates.state(),
                secret.metadata.namespace.as_deref(),
                &secret.name_any(),
            )
        }
    });

    let issuer_triggers = watcher(
        watch_namespace.get_api::<Issuer>(client),
        watcher::Config::default(),
    )
    .default_backoff()
    .touched_objects()
    .map_ok({
        let certificates = certificates.clone();
        move |issuer| certificates_for_issuer(&certificates.state(), &GenericIssuer::Issuer(issuer))
    });

    let cluster_issuer_triggers = watcher(
        Api::<ClusterIssuer>::all(client.as_kube_client()),
        watcher::Config::default(),
    )
    .default_backoff()
    .touched_objects()
    .map_ok({
        let certificates = certificates.clone();
        move |issuer| {
            certificates_for_issuer(&certificates.state(), &GenericIssuer::ClusterIssuer(issuer))
        }
    });

    let triggers = stream::select_all([
        certificate_triggers.boxed(),
        secret_triggers.boxed(),
        issuer_triggers.boxed(),
        cluster_issuer_triggers.boxed(),
    ]);

    let watch = {
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        async move {
            let enqueue = triggers.for_each(|keys| {
                match keys {
                    Ok(keys) => keys.into_iter().for_each(|key| queue.add(key)),
                    Err(error) => tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "watch failed, retrying"
                    ),
                }
                futures::future::ready(())
            });
            tokio::select! {
                _ = enqueue => {}
                _ = shutdown.cancelled() => {}
            }
            queue.shutdown();
        }
    };

    let renewals = ctx.scheduler.run(
        {
            let queue = queue.clone();
            move |key| queue.add(key)
        },
        shutdown,
    );

    let workers = futures::future::join_all((0..workers).map(|_| worker(&ctx, &queue)));

    tracing::info!(controller = FULL_CONTROLLER_NAME, "starting controller");
    tokio::join!(watch, renewals, workers);
}

async fn worker(ctx: &Ctx, queue: &WorkQueue<CertificateKey>) {
    while let Some(key) = queue.get().await {
        match sync(ctx, &key).await {
            Ok(()) => queue.forget(&key),
            Err(error) => {
                let backoff = queue.failure_backoff(&key);
                tracing::error!(
                    controller = FULL_CONTROLLER_NAME,
                    certificate = %key,
                    category = error.category(),
                    secondary_object = error.secondary_object().map(|obj| obj.to_string()),
                    error = &error as &dyn std::error::Error,
                    ?backoff,
                    "failed to reconcile Certificate"
                );
                ctx.scheduler.add(key.clone(), backoff);
            }
        }
        queue.done(&key);
    }
}
