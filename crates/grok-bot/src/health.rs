use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use grok_pipeline::StatusReporter;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use serde_json::json;
use tracing::{info, warn};

pub fn router(reporter: Arc<StatusReporter>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(reporter)
}

async fn health(State(reporter): State<Arc<StatusReporter>>) -> Response {
    // The snapshot queries SQLite and can sit on the busy timeout.
    match tokio::task::spawn_blocking(move || reporter.snapshot(Utc::now())).await {
        Ok(snapshot) => {
            let status = if snapshot.healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (status, Json(snapshot)).into_response()
        }
        Err(err) => {
            warn!(event = "health_snapshot_error", error = %err);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "healthy": false, "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn serve(
    listener: TcpListener,
    reporter: Arc<StatusReporter>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(event = "health_start", addr = %addr);
    }
    axum::serve(listener, router(reporter))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
