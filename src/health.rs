use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub backend: CheckResult,
    pub pid: u32,
    /// RFC 3339 UTC timestamp of the check.
    pub now: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    pub fn healthy() -> Self {
        Self {
            ok: true,
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz`.  200 when the backend is usable, 503 otherwise.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backend = state.backend.healthz().await;

    let (status, http_status) = if backend.ok {
        (HealthStatus::Ok, StatusCode::OK)
    } else {
        warn!(message = ?backend.message, "health check failed");
        (HealthStatus::Degraded, StatusCode::SERVICE_UNAVAILABLE)
    };

    let body = HealthResponse {
        status,
        backend,
        pid: std::process::id(),
        now: chrono::Utc::now().to_rfc3339(),
    };

    (http_status, Json(body))
}
