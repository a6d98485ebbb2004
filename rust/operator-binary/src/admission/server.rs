//! HTTP(S) endpoint of the admission webhook.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use snafu::{ResultExt, Snafu};
use stackable_operator::kube::core::{
    admission::{AdmissionRequest, AdmissionReview},
    DynamicObject,
};
use tokio_util::sync::CancellationToken;

use super::{reject_invalid, AdmissionRegistry};

/// How long in-flight reviews may take to finish after shutdown was requested.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load webhook TLS key pair from {certificate:?} and {private_key:?}"))]
    LoadTls {
        source: std::io::Error,
        certificate: PathBuf,
        private_key: PathBuf,
    },

    #[snafu(display("failed to serve admission webhook on {address}"))]
    Serve {
        source: std::io::Error,
        address: SocketAddr,
    },
}

#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

pub fn router(registry: Arc<AdmissionRegistry>) -> Router {
    Router::new()
        .route("/validate", post(validate))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(registry)
}

async fn validate(
    State(registry): State<Arc<AdmissionRegistry>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(error) => {
            tracing::debug!(
                error = &error as &dyn std::error::Error,
                "rejecting AdmissionReview without request"
            );
            return Json(reject_invalid(error).into_review());
        }
    };
    Json(registry.review(&request).await.into_review())
}

/// Serves the webhook on `address` until `shutdown` is cancelled.
///
/// Plain HTTP is only used when no TLS key pair is configured.
pub async fn run(
    address: SocketAddr,
    tls: Option<TlsFiles>,
    registry: Arc<AdmissionRegistry>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let app = router(registry).into_make_service();
    let handle = Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown.cancelled().await;
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
        }
    });

    let served = match tls {
        Some(tls) => {
            let config = RustlsConfig::from_pem_file(&tls.certificate, &tls.private_key)
                .await
                .context(LoadTlsSnafu {
                    certificate: tls.certificate.clone(),
                    private_key: tls.private_key.clone(),
                })?;
            tracing::info!(%address, "serving admission webhook over HTTPS");
            axum_server::bind_rustls(address, config)
                .handle(handle)
                .serve(app)
                .await
        }
        None => {
            tracing::warn!(%address, "no webhook TLS key pair configured, serving plain HTTP");
            axum_server::bind(address).handle(handle).serve(app).await
        }
    };
    served.context(ServeSnafu { address })
}
