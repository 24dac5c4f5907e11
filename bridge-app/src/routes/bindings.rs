use crate::binding::IssuedCode;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json};
use bridge_channels::PlatformType;
use bridge_store::Binding;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct GenerateCodeRequest {
    employee_id: i64,
    #[serde(default)]
    platform_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    employee_id: Option<i64>,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/bridge/bindings", get(list_bindings))
        .route("/api/v1/bridge/bindings/code", post(generate_code))
        .route("/api/v1/bridge/bindings/purge", post(purge_expired))
        .route("/api/v1/bridge/bindings/{id}/revoke", post(revoke_binding))
}

#[tracing::instrument(level = "info", skip_all, fields(employee_id = req.employee_id))]
async fn generate_code(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<GenerateCodeRequest>,
) -> ApiResult<(StatusCode, Json<IssuedCode>)> {
    let platform = req
        .platform_type
        .as_deref()
        .map(str::parse::<PlatformType>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let issued = state.bindings.generate_code(req.employee_id, platform).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_bindings(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Binding>>> {
    Ok(Json(state.bindings.list_bindings(query.employee_id).await?))
}

#[tracing::instrument(level = "info", skip_all, fields(binding_id = id))]
async fn revoke_binding(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Binding>> {
    Ok(Json(state.bindings.revoke(id).await?))
}

#[tracing::instrument(level = "info", skip_all)]
async fn purge_expired(
    Extension(state): Extension<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let purged = state.bindings.purge_expired(Utc::now()).await?;
    Ok(Json(serde_json::json!({ "status": "ok", "purged": purged })))
}

#[cfg(test)]
mod tests {
    use crate::testing::{RecordingAdapter, TestApp};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use bridge_channels::PlatformType;
    use serde_json::json;

    #[tokio::test]
    async fn code_is_issued_redeemed_over_webhook_and_revoked() {
        let app = TestApp::with_adapter(RecordingAdapter::new(PlatformType::Telegram)).await;
        let issued = app
            .post_json(
                "/api/v1/bridge/bindings/code",
                json!({"employee_id": app.employee_id}),
            )
            .await;
        assert_eq!(issued.status(), StatusCode::CREATED);
        let issued = TestApp::json(issued).await;
        let code = issued["code"].as_str().expect("code").to_string();
        assert_eq!(code.len(), 8);
        assert_eq!(issued["platform_type"], "TELEGRAM");
        assert!(issued["deep_link_url"].is_null());

        let webhook = app
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/webhooks/telegram")
                    .body(Body::from(
                        json!({"user": "12345", "text": format!("/start {code}")}).to_string(),
                    ))
                    .expect("request"),
            )
            .await;
        assert_eq!(webhook.status(), StatusCode::OK);

        let listed = TestApp::json(
            app.get(&format!("/api/v1/bridge/bindings?employee_id={}", app.employee_id))
                .await,
        )
        .await;
        assert_eq!(listed[0]["status"], "ACTIVE");
        assert_eq!(listed[0]["platform_user_id"], "12345");
        let binding_id = listed[0]["id"].as_i64().expect("id");

        let revoked = app
            .post_json(&format!("/api/v1/bridge/bindings/{binding_id}/revoke"), json!({}))
            .await;
        assert_eq!(revoked.status(), StatusCode::OK);
        assert_eq!(TestApp::json(revoked).await["status"], "REVOKED");
    }

    #[tokio::test]
    async fn code_for_unknown_employee_or_platform_is_rejected() {
        let app = TestApp::new().await;
        let missing = app
            .post_json("/api/v1/bridge/bindings/code", json!({"employee_id": 424242}))
            .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let bad_platform = app
            .post_json(
                "/api/v1/bridge/bindings/code",
                json!({"employee_id": app.employee_id, "platform_type": "fax"}),
            )
            .await;
        assert_eq!(bad_platform.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn purge_reports_count() {
        let app = TestApp::new().await;
        let response = app.post_json("/api/v1/bridge/bindings/purge", json!({})).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(TestApp::json(response).await["purged"], 0);
    }
}
