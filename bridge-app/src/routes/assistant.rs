//! Direct assistant chat for the admin UI. History lives in memory per conversation id.

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;
use axum::extract::Path;
use axum::routing::{delete, post};
use axum::{Extension, Json};
use bridge_llm::{ChatMessage, ToolDefinition};
use serde::Deserialize;
use std::sync::Arc;
use ulid::Ulid;

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    message: String,
    /// Answers to the tool calls returned by the previous turn.
    #[serde(default)]
    tool_results: Vec<ToolResult>,
    #[serde(default)]
    tools: Vec<ToolDefinition>,
}

#[derive(Debug, Deserialize)]
struct ToolResult {
    tool_call_id: String,
    #[serde(default)]
    content: String,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/bridge/assistant/chat", post(chat))
        .route(
            "/api/v1/bridge/assistant/chat/{conversation_id}",
            delete(reset_conversation),
        )
}

/// Tool results must answer exactly the calls still open in the conversation.
fn check_tool_results(pending: &[String], results: &[ToolResult]) -> ApiResult<()> {
    if let Some(unknown) = results
        .iter()
        .find(|r| !pending.iter().any(|id| *id == r.tool_call_id))
    {
        return Err(ApiError::BadRequest(format!(
            "tool_call_id {:?} does not match an open tool call",
            unknown.tool_call_id
        )));
    }
    let missing: Vec<&str> = pending
        .iter()
        .filter(|id| !results.iter().any(|r| r.tool_call_id == **id))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "tool results missing for: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

#[tracing::instrument(level = "info", skip_all)]
async fn chat(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let message = req.message.trim();
    if message.is_empty() && req.tool_results.is_empty() {
        return Err(ApiError::BadRequest(
            "message or tool_results is required".to_string(),
        ));
    }
    let conversation_id = req
        .conversation_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Ulid::new().to_string());
    check_tool_results(
        &state.sessions.pending_tool_call_ids(&conversation_id),
        &req.tool_results,
    )?;

    let mut turn: Vec<ChatMessage> = req
        .tool_results
        .iter()
        .map(|r| ChatMessage::tool_result(r.tool_call_id.as_str(), r.content.as_str()))
        .collect();
    if !message.is_empty() {
        turn.push(ChatMessage::user(message));
    }
    let mut messages = Vec::new();
    if !state.system_prompt.trim().is_empty() {
        messages.push(ChatMessage::system(state.system_prompt.as_str()));
    }
    messages.extend(state.sessions.history(&conversation_id));
    messages.extend(turn.iter().cloned());

    let response = state.llm.chat(&messages, &req.tools).await?;
    turn.push(response.message.clone());
    state.sessions.append(&conversation_id, turn);
    tracing::info!(
        %conversation_id,
        tool_results = req.tool_results.len(),
        tool_calls = response.message.tool_calls.len(),
        finish_reason = %response.finish_reason,
        "assistant chat turn completed"
    );

    Ok(Json(serde_json::json!({
        "status": "ok",
        "conversation_id": conversation_id,
        "reply": response.message.content,
        "tool_calls": response.message.tool_calls,
        "finish_reason": response.finish_reason,
        "usage": response.usage,
    })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn reset_conversation(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Json<serde_json::Value> {
    let existed = state.sessions.reset(&conversation_id);
    Json(serde_json::json!({ "status": "ok", "reset": existed }))
}
