//! Admission webhook server.
//!
//! Serves `/mutate` over TLS (rustls, so nothing below TLS 1.2), plus
//! `/health` and `/ready` probes. Certificate paths come from
//! `WEBHOOK_CERT_FILE` / `WEBHOOK_KEY_FILE`. Shutdown drains in-flight
//! reviews for up to ten seconds.

pub mod mutate;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::AdmissionReview;
use serde_json::{json, Value};
use tracing::{error, info};

use coredog_common::Config;

use crate::notice::Notifier;

/// Port the admission server listens on.
pub const WEBHOOK_PORT: u16 = 8443;

/// How long in-flight reviews may drain after a shutdown signal.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

const DEFAULT_CERT_FILE: &str = "/etc/webhook/certs/tls.crt";
const DEFAULT_KEY_FILE: &str = "/etc/webhook/certs/tls.key";

struct WebhookState {
    alerts: Notifier,
}

/// Run the admission server until SIGINT/SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let cert_file =
        std::env::var("WEBHOOK_CERT_FILE").unwrap_or_else(|_| DEFAULT_CERT_FILE.to_string());
    let key_file = std::env::var("WEBHOOK_KEY_FILE").unwrap_or_else(|_| DEFAULT_KEY_FILE.to_string());

    let state = Arc::new(WebhookState {
        alerts: Notifier::new(
            config.notice_channels.clone(),
            config.message_template.clone(),
            config.message_labels.clone(),
        ),
    });

    let app = Router::new()
        .route("/mutate", post(mutate_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/ready", get(|| async { "ready" }))
        .with_state(state);

    let tls = RustlsConfig::from_pem_file(&cert_file, &key_file)
        .await
        .with_context(|| format!("failed to load TLS key pair ({cert_file}, {key_file})"))?;

    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!(%addr, "starting admission webhook server");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("webhook server failed")?;

    info!("webhook server stopped");
    Ok(())
}

async fn shutdown_on_signal(handle: Handle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    handle.graceful_shutdown(Some(SHUTDOWN_DRAIN));
}

/// `/mutate`: decode the review, synthesize the patch, admit.
///
/// A body that does not decode as an AdmissionReview of a Pod still admits
/// (injection must never block pod creation); operators get an alert so
/// the silently-uncollected pod does not go unnoticed.
async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let review: AdmissionReview<Pod> = match serde_json::from_value(body) {
        Ok(review) => review,
        Err(e) => {
            error!(error = %e, "could not decode admission review");
            alert_admitted_uncollected(&state, &e.to_string()).await;
            return Json(allow_unchanged());
        }
    };

    let result = match mutate::mutate_review(review) {
        Ok(result) => result,
        Err(reason) => {
            alert_admitted_uncollected(&state, &reason).await;
            return Json(allow_unchanged());
        }
    };

    match serde_json::to_value(&result) {
        Ok(value) => Json(value),
        Err(e) => {
            error!(error = %e, "could not encode admission response");
            Json(allow_unchanged())
        }
    }
}

/// Fallback response admitting the pod with no mutation.
fn allow_unchanged() -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": {"uid": "", "allowed": true}
    })
}

/// Tell operators a pod slipped through without core-dump collection.
async fn alert_admitted_uncollected(state: &WebhookState, reason: &str) {
    state
        .alerts
        .send_raw(&format!(
            "coredog webhook could not process an admission review ({reason}); \
             the pod was admitted without core-dump collection"
        ))
        .await;
}
