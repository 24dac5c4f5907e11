use crate::error::ApiResult;
use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/bridge/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(
    Extension(state): Extension<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let schema_version = state.store.schema_version().await?;
    let pending_tasks = state.queue.pending_count().await?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "checks": {
            "database": { "schema_version": schema_version },
            "platforms": state.adapters.platforms(),
            "tasks": { "pending": pending_tasks, "dispatch": state.dispatch },
            "assistant": { "model": state.llm.model(), "conversations": state.sessions.len() },
        }
    })))
}
