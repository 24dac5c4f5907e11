use crate::config::BridgeConfig;
use axum::Json;
use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bridge_channels::constant_time_eq;
use serde_json::json;

/// Who may issue mutating admin requests.
#[derive(Debug, Clone, Default)]
pub struct AdminAuthPolicy {
    pub api_keys: Vec<String>,
    pub allow_insecure: bool,
}

impl AdminAuthPolicy {
    pub fn from_config(cfg: &BridgeConfig) -> Self {
        let api_keys = cfg
            .security
            .admin_api_keys
            .iter()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect();
        Self {
            api_keys,
            allow_insecure: cfg.security.allow_insecure_admin,
        }
    }

    fn accepts(&self, provided: &str) -> bool {
        self.api_keys
            .iter()
            .any(|key| constant_time_eq(key, provided))
    }
}

#[derive(Debug, Clone)]
pub struct AdminAuthPolicyExt(pub AdminAuthPolicy);

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn parse_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = raw.trim().splitn(2, char::is_whitespace);
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn unauthorized(code: &str, message: &str) -> Response {
    tracing::warn!(error_code = code, error = %message, "admin auth rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "status": "error", "error": message, "error_code": code })),
    )
        .into_response()
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn require_admin_auth(req: Request<Body>, next: Next) -> Response {
    if !is_mutating(req.method()) {
        return next.run(req).await;
    }

    let policy = req
        .extensions()
        .get::<AdminAuthPolicyExt>()
        .map(|v| v.0.clone())
        .unwrap_or_default();

    if !policy.api_keys.is_empty() {
        let Some(provided) = parse_bearer_token(req.headers()) else {
            return unauthorized("missing_bearer_token", "missing bearer token");
        };
        if !policy.accepts(&provided) {
            return unauthorized("invalid_bearer_token", "invalid bearer token");
        }
        return next.run(req).await;
    }

    if policy.allow_insecure {
        return next.run(req).await;
    }

    unauthorized(
        "missing_admin_auth_config",
        "mutating requests require security.admin_api_keys",
    )
}
