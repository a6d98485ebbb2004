use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::ensure;
use clap::{crate_description, crate_version, Parser};
use stackable_certificate_operator::{
    admission::{
        server::{self, TlsFiles},
        AdmissionRegistry, SubjectAccessReviewer,
    },
    certificate_controller::{self, DuplicateSecretNameScope},
    client::KubeCertificateClient,
    crd::{Certificate, ClusterIssuer, Issuer},
    events::KubeEventRecorder,
    issuer::KubeIssuerFactory,
    issuer_controller,
    restart::{self, KubeWorkloadRestarter, RestartNotifier},
    scheduler::Scheduler,
    secret::KubeSecretStore,
    utils::SystemClock,
    OPERATOR_NAME,
};
use stackable_operator::{
    kube::runtime::reflector, logging::TracingTarget, namespace::WatchNamespace,
    time::Duration, CustomResourceExt,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

pub const APP_NAME: &str = "certificate";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<CertificateOperatorRun>,
}

#[derive(clap::Parser)]
struct CertificateOperatorRun {
    /// Only watch Certificates, Issuers and Secrets in this namespace
    #[arg(long, env, default_value = "")]
    watch_namespace: WatchNamespace,

    /// Number of Certificates that are reconciled concurrently
    #[arg(long, env, default_value_t = 4)]
    workers: usize,

    /// Fraction of a certificate's validity before its expiry at which it is renewed, unless
    /// the Certificate sets renewBefore
    #[arg(long, env, default_value_t = 1.0 / 3.0)]
    renew_before_ratio: f64,

    /// Whether Certificates in different namespaces may share a secretName
    #[arg(long, env, default_value_t, value_enum)]
    duplicate_secret_name_scope: DuplicateSecretNameScope,

    /// Make each Certificate the controller owner of its Secret
    #[arg(long, env)]
    enable_certificate_owner_ref: bool,

    /// Namespace that Secrets referenced by ClusterIssuers are read from
    #[arg(long, env, default_value = "stackable-operators")]
    cluster_resource_namespace: String,

    #[arg(long, env, default_value = "5m")]
    issue_timeout: Duration,

    /// Delay before retrying a Certificate whose issuer failed
    #[arg(long, env, default_value = "1m")]
    issue_retry_delay: Duration,

    /// Maximum duration of a SubjectAccessReview made by the admission webhook
    #[arg(long, env, default_value = "10s")]
    authorization_timeout: Duration,

    #[arg(long, env, default_value = "0.0.0.0:8443")]
    webhook_address: SocketAddr,

    /// PEM certificate served by the admission webhook
    #[arg(long, env, requires = "webhook_tls_private_key")]
    webhook_tls_certificate: Option<PathBuf>,

    /// PEM private key of the admission webhook
    #[arg(long, env, requires = "webhook_tls_certificate")]
    webhook_tls_private_key: Option<PathBuf>,

    #[arg(long, env)]
    disable_webhook: bool,

    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        stackable_operator::cli::Command::Crd => {
            Certificate::print_yaml_schema()?;
            Issuer::print_yaml_schema()?;
            ClusterIssuer::print_yaml_schema()?;
        }
        stackable_operator::cli::Command::Run(run) => {
            stackable_operator::logging::initialize_logging(
                "CERTIFICATE_OPERATOR_LOG",
                APP_NAME,
                run.tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            ensure!(
                run.renew_before_ratio > 0.0 && run.renew_before_ratio < 1.0,
                "--renew-before-ratio must be between 0 and 1, got {}",
                run.renew_before_ratio
            );
            ensure!(run.workers > 0, "--workers must be at least 1");
            run_operator(run).await?;
        }
    }
    Ok(())
}

async fn run_operator(run: CertificateOperatorRun) -> anyhow::Result<()> {
    // rustls has no process-wide crypto provider unless exactly one is compiled in
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let client = stackable_operator::client::create_client(Some(OPERATOR_NAME.to_string())).await?;
    let kube_client = client.as_kube_client();
    let watch_namespace = run.watch_namespace;
    let (certificates, certificates_writer) = reflector::store::<Certificate>();

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            tracing::info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    let secrets = Arc::new(KubeSecretStore::new(kube_client.clone()));
    let certificate_client = Arc::new(KubeCertificateClient::new(
        kube_client.clone(),
        certificates,
    ));
    let issuers = Arc::new(KubeIssuerFactory::new(
        secrets.clone(),
        run.cluster_resource_namespace,
    ));
    let (notifier, rotations) = RestartNotifier::channel();

    let certificate_ctx = Arc::new(certificate_controller::Ctx {
        client: certificate_client.clone(),
        secrets,
        issuers: issuers.clone(),
        recorder: Arc::new(KubeEventRecorder::new(
            kube_client.clone(),
            certificate_controller::FULL_CONTROLLER_NAME,
        )),
        scheduler: Arc::new(Scheduler::new()),
        notifier,
        clock: Arc::new(SystemClock),
        options: certificate_controller::Options {
            renew_before_ratio: run.renew_before_ratio,
            duplicate_secret_name_scope: run.duplicate_secret_name_scope,
            enable_certificate_owner_ref: run.enable_certificate_owner_ref,
            issue_timeout: *run.issue_timeout,
            issue_retry_delay: *run.issue_retry_delay,
        },
    });
    let issuer_ctx = Arc::new(issuer_controller::Ctx {
        client: certificate_client,
        issuers,
        clock: Arc::new(SystemClock),
    });
    let restarter = KubeWorkloadRestarter::new(kube_client.clone());

    let disable_webhook = run.disable_webhook;
    let webhook_address = run.webhook_address;
    let authorization_timeout = *run.authorization_timeout;
    let tls = run
        .webhook_tls_certificate
        .zip(run.webhook_tls_private_key)
        .map(|(certificate, private_key)| TlsFiles {
            certificate,
            private_key,
        });
    let webhook = async {
        if disable_webhook {
            tracing::info!("admission webhook is disabled");
            return Ok(());
        }
        let registry = Arc::new(AdmissionRegistry::standard(Arc::new(
            SubjectAccessReviewer::new(kube_client.clone(), authorization_timeout),
        )));
        let result = server::run(webhook_address, tls, registry, shutdown.clone()).await;
        if result.is_err() {
            shutdown.cancel();
        }
        result
    };

    let (webhook, (), (), ()) = tokio::join!(
        webhook,
        certificate_controller::start(
            &client,
            &watch_namespace,
            certificates_writer,
            certificate_ctx,
            run.workers,
            shutdown.clone(),
        ),
        issuer_controller::start(&client, &watch_namespace, issuer_ctx, shutdown.clone()),
        restart::run(rotations, &restarter, shutdown.clone()),
    );
    webhook?;
    Ok(())
}
