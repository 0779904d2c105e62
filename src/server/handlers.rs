//! Ops API handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::message::MeshMessage;
use crate::pool::{PoolSummary, DEFAULT_MAX_WORKERS_DOWN};

use super::AppState;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Pool status endpoint
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        host: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string()),
        reported_at: chrono::Utc::now(),
        pool: state.pool.summary(),
    })
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub host: String,
    pub reported_at: chrono::DateTime<chrono::Utc>,
    pub pool: PoolSummary,
}

/// Rolling-restart request body
#[derive(Debug, Deserialize)]
pub struct RestartRequest {
    /// Restrict the restart to one worker group.
    #[serde(default)]
    pub name: Option<String>,
    /// Bound on simultaneously-down workers; below 1 is a fraction of the
    /// pool size.
    #[serde(default)]
    pub max_workers_down: Option<f64>,
    /// Start replacements as old workers shut down.
    #[serde(default)]
    pub start_replacements: Option<bool>,
}

/// Trigger a rolling restart. Returns immediately; the roll continues in the
/// background and progress is visible on `/status`.
pub async fn restart(
    State(state): State<AppState>,
    Json(request): Json<RestartRequest>,
) -> impl IntoResponse {
    let max_down = request.max_workers_down.unwrap_or(DEFAULT_MAX_WORKERS_DOWN);
    let start_replacements = request.start_replacements.unwrap_or(true);
    info!(
        "restart requested over ops API (group {:?}, max {} down)",
        request.name, max_down
    );

    let pool = state.pool.clone();
    tokio::spawn(async move {
        pool.restart_workers(request.name.as_deref(), max_down, start_replacements)
            .await;
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "restarting" })),
    )
}

/// Inject a mesh broadcast. The body must carry a `type` tag; tags unknown to
/// the workers are delivered and ignored there, which keeps mixed-version
/// fleets safe.
pub async fn broadcast(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    match serde_json::from_value::<MeshMessage>(body) {
        Ok(message) => {
            state.pool.broadcast(&message);
            (
                StatusCode::OK,
                Json(serde_json::json!({ "status": "sent" })),
            )
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::budget::MemoryBudget;
    use crate::pool::PoolManager;
    use crate::worker::ThreadLauncher;

    fn test_state() -> AppState {
        AppState {
            pool: PoolManager::with_launcher(
                MemoryBudget {
                    old_gen_mb: 512,
                    young_gen_mb: 16,
                },
                Arc::new(ThreadLauncher),
            ),
        }
    }

    #[tokio::test]
    async fn test_status_reports_empty_pool() {
        let state = test_state();
        let response = status(State(state)).await;
        // Handler runs without touching the network; shape is checked via the
        // summary it embeds.
        let _ = response.into_response();
    }

    #[tokio::test]
    async fn test_broadcast_rejects_untagged_body() {
        let state = test_state();
        let response = broadcast(
            State(state),
            Json(serde_json::json!({ "payload": "no type tag" })),
        )
        .await;
        let response = response.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_broadcast_accepts_unknown_tag() {
        let state = test_state();
        let response = broadcast(
            State(state),
            Json(serde_json::json!({ "type": "future-command" })),
        )
        .await;
        let response = response.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
