//! Message log queries and the polling-dispatch reply loop: an external AI client lists PENDING
//! messages, claims one, then posts a reply or a failure.

use crate::config::AiDispatch;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;
use axum::extract::{Path, Query};
use axum::routing::{get, post};
use axum::{Extension, Json};
use bridge_channels::PlatformType;
use bridge_store::{
    MessageDirection, MessageFilter, MessageLog, NewMessageLog, Page, ProcessingStatus,
};
use chrono::Utc;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;

const DEFAULT_PAGE_SIZE: u32 = 20;
const DEFAULT_PENDING_LIMIT: u32 = 20;

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    page: Option<u32>,
    size: Option<u32>,
    platform: Option<String>,
    status: Option<String>,
    direction: Option<String>,
    binding_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct PendingQuery {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ReplyRequest {
    reply: String,
}

#[derive(Debug, Deserialize)]
struct FailRequest {
    error: String,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/bridge/messages", get(list_messages))
        .route("/api/v1/bridge/messages/pending", get(list_pending))
        .route(
            "/api/v1/bridge/messages/{id}/processing",
            post(mark_processing),
        )
        .route("/api/v1/bridge/messages/{id}/reply", post(reply_to_message))
        .route("/api/v1/bridge/messages/{id}/fail", post(fail_message))
}

fn parse_param<T>(name: &str, raw: Option<&str>) -> ApiResult<Option<T>>
where
    T: FromStr<Err = String>,
{
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| ApiError::BadRequest(format!("invalid {name}: {e}")))
        })
        .transpose()
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_messages(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Page<MessageLog>>> {
    let filter = MessageFilter {
        platform_type: parse_param::<PlatformType>("platform", query.platform.as_deref())?,
        status: parse_param::<ProcessingStatus>("status", query.status.as_deref())?,
        direction: parse_param::<MessageDirection>("direction", query.direction.as_deref())?,
        binding_id: query.binding_id,
    };
    let page = state
        .store
        .list_message_logs(
            filter,
            query.page.unwrap_or(0),
            query.size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(Json(page))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_pending(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<PendingQuery>,
) -> ApiResult<Json<Vec<MessageLog>>> {
    let limit = query.limit.unwrap_or(DEFAULT_PENDING_LIMIT);
    Ok(Json(state.store.list_pending_messages(limit).await?))
}

/// With worker dispatch the pool owns PROCESSING rows, so polled claims and replies are refused.
fn require_polling(state: &AppState) -> ApiResult<()> {
    if state.dispatch != AiDispatch::Polling {
        return Err(ApiError::Conflict(
            "ai replies are produced by the worker pool".to_string(),
        ));
    }
    Ok(())
}

#[tracing::instrument(level = "info", skip_all, fields(message_log_id = id))]
async fn mark_processing(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<MessageLog>> {
    require_polling(&state)?;
    if !state.store.mark_message_processing(id).await? {
        return Err(ApiError::Conflict(format!("message {id} is not pending")));
    }
    Ok(Json(state.store.get_message_log(id).await?))
}

async fn load_open_inbound(state: &AppState, id: i64) -> ApiResult<MessageLog> {
    let message = state.store.get_message_log(id).await?;
    if message.direction != MessageDirection::Inbound {
        return Err(ApiError::BadRequest(format!("message {id} is not inbound")));
    }
    if message.processing_status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "message {id} is already {}",
            message.processing_status
        )));
    }
    Ok(message)
}

/// Sends `reply` to the sender of a PROCESSING message. The inbound row is completed before
/// delivery so concurrent replies cannot both send; a failed delivery puts it back to
/// PROCESSING and is logged as a FAILED outbound row.
#[tracing::instrument(level = "info", skip_all, fields(message_log_id = id))]
async fn reply_to_message(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ReplyRequest>,
) -> ApiResult<Json<MessageLog>> {
    if req.reply.trim().is_empty() {
        return Err(ApiError::BadRequest("reply must not be empty".to_string()));
    }
    require_polling(&state)?;
    let inbound = load_open_inbound(&state, id).await?;
    let adapter = state.adapters.get(inbound.platform_type).ok_or_else(|| {
        ApiError::Upstream(format!("no adapter configured for {}", inbound.platform_type))
    })?;
    if !state.store.claim_message_reply(id, Utc::now()).await? {
        let current = state.store.get_message_log(id).await?;
        return Err(ApiError::Conflict(format!(
            "message {id} is {}, expected PROCESSING",
            current.processing_status
        )));
    }

    let mut outbound = NewMessageLog::outbound(
        inbound.binding_id,
        inbound.platform_type,
        inbound.platform_user_id.as_str(),
        req.reply.as_str(),
        Utc::now(),
    );
    let sent = adapter.send(&inbound.platform_user_id, &req.reply).await;
    if let Err(e) = &sent {
        outbound.processing_status = ProcessingStatus::Failed;
        outbound.error_message = Some(e.to_string());
    }
    state.store.insert_message_log(outbound).await?;
    if let Err(e) = sent {
        state.store.release_message_reply(id).await?;
        return Err(ApiError::Upstream(format!("reply delivery failed: {e}")));
    }

    tracing::info!("polled reply delivered");
    Ok(Json(state.store.get_message_log(id).await?))
}

#[tracing::instrument(level = "info", skip_all, fields(message_log_id = id))]
async fn fail_message(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<FailRequest>,
) -> ApiResult<Json<MessageLog>> {
    load_open_inbound(&state, id).await?;
    let error = req.error.trim();
    let error = if error.is_empty() { "failed by client" } else { error };
    let failed = state
        .store
        .update_message_status(id, ProcessingStatus::Failed, Some(error), Utc::now())
        .await?;
    Ok(Json(failed))
}
