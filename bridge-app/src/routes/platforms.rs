use crate::error::{ApiError, ApiResult};
use crate::platforms::{Activation, activate_platform, redact, restore_redacted};
use crate::server::AppState;
use axum::extract::Path;
use axum::routing::get;
use axum::{Extension, Json};
use bridge_channels::PlatformType;
use bridge_store::{PlatformConfig, PlatformConfigUpdate};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/bridge/platforms", get(list_platforms))
        .route(
            "/api/v1/bridge/platforms/{platform}",
            get(get_platform).put(put_platform).delete(delete_platform),
        )
}

fn parse_platform(raw: &str) -> ApiResult<PlatformType> {
    raw.parse().map_err(ApiError::BadRequest)
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_platforms(
    Extension(state): Extension<Arc<AppState>>,
) -> ApiResult<Json<Vec<PlatformConfig>>> {
    let configs = state.store.list_platform_configs().await?;
    Ok(Json(configs.iter().map(redact).collect()))
}

#[tracing::instrument(level = "debug", skip_all, fields(platform = %platform))]
async fn get_platform(
    Extension(state): Extension<Arc<AppState>>,
    Path(platform): Path<String>,
) -> ApiResult<Json<PlatformConfig>> {
    let platform = parse_platform(&platform)?;
    let config = state
        .store
        .get_platform_config(platform)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{platform} is not configured")))?;
    Ok(Json(redact(&config)))
}

/// Saves the row, then rebuilds the adapter. Activation failures are reported but the saved
/// row stays.
#[tracing::instrument(level = "info", skip_all, fields(platform = %platform))]
async fn put_platform(
    Extension(state): Extension<Arc<AppState>>,
    Path(platform): Path<String>,
    Json(mut update): Json<PlatformConfigUpdate>,
) -> ApiResult<Json<serde_json::Value>> {
    let platform = parse_platform(&platform)?;
    let existing = state.store.get_platform_config(platform).await?;
    restore_redacted(&mut update.config_data, existing.as_ref());
    let saved = state
        .store
        .upsert_platform_config(platform, update, Utc::now())
        .await?;
    match activate_platform(&state.store, &state.adapters, saved.clone(), Activation::Reconfigure)
        .await
    {
        Ok(active) => Ok(Json(serde_json::json!({
            "status": "ok",
            "active": state.adapters.get(platform).is_some(),
            "config": redact(&active),
        }))),
        Err(e) => {
            tracing::warn!(error = %e, "platform saved but adapter could not be started");
            state.adapters.remove(platform);
            Ok(Json(serde_json::json!({
                "status": "error",
                "error": e.to_string(),
                "active": false,
                "config": redact(&saved),
            })))
        }
    }
}

#[tracing::instrument(level = "info", skip_all, fields(platform = %platform))]
async fn delete_platform(
    Extension(state): Extension<Arc<AppState>>,
    Path(platform): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let platform = parse_platform(&platform)?;
    if !state.store.delete_platform_config(platform).await? {
        return Err(ApiError::NotFound(format!("{platform} is not configured")));
    }
    state.adapters.remove(platform);
    tracing::info!("platform config deleted; adapter removed");
    Ok(Json(serde_json::json!({ "status": "ok" })))
}
