use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use super::blocking;
use crate::api::AppState;

const SERVICE: &str = "pathsync";

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": SERVICE }))
}

/// Store round trip plus live session counts. `503` when the store check
/// fails.
pub async fn health_detailed(State(state): State<AppState>) -> impl IntoResponse {
    let store = blocking(&state.db, |db| db.ping()).await;
    let stats = state.sessions.stats().await;

    let (status, store_status) = match &store {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::warn!(error = %e, "Store health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };

    let body = json!({
        "status": if status == StatusCode::OK { "ok" } else { "degraded" },
        "service": SERVICE,
        "store": store_status,
        "sessions": stats,
    });
    (status, Json(body))
}
