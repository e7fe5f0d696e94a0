//! HTTP ingress for Alertmanager webhooks.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::alert::WebhookMessage;
use crate::debounce::{DebounceQueue, EnqueueOutcome};

/// Label an alert must carry to be handled.
pub const DEFAULT_ENABLED_LABEL: &str = "githubfilesenabled";

/// Shared state for the ingress handlers.
pub struct ReceiverState {
    pub queue: Arc<DebounceQueue>,
    /// Gating label; alerts without it are acknowledged and ignored
    pub enabled_label: String,
}

impl ReceiverState {
    #[must_use]
    pub fn new(queue: Arc<DebounceQueue>, enabled_label: impl Into<String>) -> Self {
        Self {
            queue,
            enabled_label: enabled_label.into(),
        }
    }
}

/// Build the receiver router.
pub fn build_router(state: Arc<ReceiverState>) -> Router {
    Router::new()
        .route("/v1/receiver", post(receive_webhook))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Response for the webhook handler.
#[derive(Debug, Serialize)]
struct ReceiverResponse {
    status: &'static str,
    alerts_received: usize,
    alerts_enqueued: usize,
    alerts_coalesced: usize,
    alerts_skipped: usize,
}

async fn receive_webhook(State(state): State<Arc<ReceiverState>>, body: Bytes) -> impl IntoResponse {
    let message: WebhookMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Rejected undecodable webhook body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "error",
                    "error": format!("invalid webhook payload: {e}"),
                })),
            )
                .into_response();
        }
    };

    let received = message.alerts.len();
    info!(
        receiver = %message.receiver,
        group_key = %message.group_key,
        status = %message.status,
        alerts = received,
        "Received Alertmanager webhook"
    );
    if message.truncated_alerts > 0 {
        warn!(
            truncated = message.truncated_alerts,
            "Alertmanager truncated alerts in this notification"
        );
    }

    let mut enqueued = 0;
    let mut coalesced = 0;
    let mut skipped = 0;
    for alert in message.alerts {
        if !alert.has_label(&state.enabled_label) {
            debug!(
                alertname = alert.name(),
                label = %state.enabled_label,
                "Skipping alert without gating label"
            );
            skipped += 1;
            continue;
        }
        match state.queue.enqueue(alert).await {
            EnqueueOutcome::Scheduled => enqueued += 1,
            EnqueueOutcome::Coalesced => coalesced += 1,
        }
    }

    (
        StatusCode::OK,
        Json(ReceiverResponse {
            status: "ok",
            alerts_received: received,
            alerts_enqueued: enqueued,
            alerts_coalesced: coalesced,
            alerts_skipped: skipped,
        }),
    )
        .into_response()
}

async fn health_check(State(state): State<Arc<ReceiverState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "githubfiles-receiver",
        "version": env!("CARGO_PKG_VERSION"),
        "pending": state.queue.pending_len().await,
    }))
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
