//! Health check endpoints.
//!
//! Used by the process supervisor to decide whether the engine is alive and
//! whether it is doing work.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (RFC 3339).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

/// Component health details.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    /// Persistence backend.
    pub store: ComponentStatus,

    /// Reconciler worker pool.
    pub workers: ComponentStatus,
}

/// Individual component status.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// "ok" or "unavailable".
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentStatus {
    fn from_check(ok: bool, message: Option<String>) -> Self {
        Self {
            status: if ok { "ok" } else { "unavailable" }.to_string(),
            message,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

/// Liveness: 200 whenever the server is up. Dependencies are not checked.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "railyard-engine".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: None,
    })
}

/// Readiness: the store answers and the worker pool is running.
/// Returns 503 otherwise.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let store_result = state.store().ping().await;
    let store_ok = store_result.is_ok();
    let workers_ok = state.engine().is_running();

    let components = ComponentHealth {
        store: ComponentStatus::from_check(store_ok, store_result.err().map(|e| e.to_string())),
        workers: ComponentStatus::from_check(
            workers_ok,
            (!workers_ok).then(|| "worker pool stopped".to_string()),
        ),
    };

    let all_ok = store_ok && workers_ok;
    let response = HealthResponse {
        status: if all_ok { "ok" } else { "degraded" }.to_string(),
        service: "railyard-engine".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: Some(components),
    };

    if all_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
