use crate::error::ApiResult;
use crate::server::AppState;
use axum::extract::Path;
use axum::routing::get;
use axum::{Extension, Json};
use bridge_store::AsyncTask;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/bridge/tasks/status", get(queue_status))
        .route("/api/v1/bridge/tasks/{id}", get(get_task))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn queue_status(
    Extension(state): Extension<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let pending = state.queue.pending_count().await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "pending": pending,
        "dispatch": state.dispatch,
    })))
}

#[tracing::instrument(level = "debug", skip_all, fields(task_id = id))]
async fn get_task(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<AsyncTask>> {
    Ok(Json(state.store.get_task(id).await?))
}
