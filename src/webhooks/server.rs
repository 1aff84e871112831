//! Webhook HTTP server handlers
//!
//! Serves the mutating (`/mutate`) and validating (`/validate`) endpoints for
//! MongoDB resources over TLS.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::post};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{error, info};

use super::admission::AdmissionPipeline;
use crate::config::WebhookConfig;
use crate::crd::MongoDB;

/// Shared state for webhook handlers
pub(crate) struct WebhookState {
    pub pipeline: AdmissionPipeline,
}

pub(crate) fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_mongodb))
        .route("/validate", post(validate_mongodb))
        .with_state(state)
}

fn into_request(
    review: AdmissionReview<MongoDB>,
) -> Result<AdmissionRequest<MongoDB>, AdmissionReview<DynamicObject>> {
    review.try_into().map_err(|e: kube::core::admission::ConvertAdmissionReviewError| {
        error!(error = %e, "Admission review missing request");
        AdmissionResponse::invalid(e.to_string()).into_review()
    })
}

pub(crate) async fn mutate_mongodb(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<MongoDB>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request = match into_request(review) {
        Ok(request) => request,
        Err(invalid) => return Json(invalid),
    };
    let decision = state.pipeline.mutate(&request).await;
    Json(decision.into_response(&request).into_review())
}

pub(crate) async fn validate_mongodb(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<MongoDB>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request = match into_request(review) {
        Ok(request) => request,
        Err(invalid) => return Json(invalid),
    };
    let decision = state.pipeline.validate(&request).await;
    Json(decision.into_response(&request).into_review())
}

/// Run the webhook server with TLS
///
/// Certificates are read once at startup from the configured PEM files.
pub async fn run_webhook_server(
    pipeline: AdmissionPipeline,
    config: &WebhookConfig,
) -> Result<(), WebhookError> {
    let state = Arc::new(WebhookState { pipeline });
    let app = create_webhook_router(state);

    let tls = RustlsConfig::from_pem_file(
        PathBuf::from(&config.cert_path),
        PathBuf::from(&config.key_path),
    )
    .await
    .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Webhook server listening on {} with TLS", addr);

    axum_server::bind_rustls(addr, tls)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}

/// Errors that can occur when running the webhook server
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Webhook server error: {0}")]
    Server(String),
}
