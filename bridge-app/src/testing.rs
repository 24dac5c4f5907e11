//! Shared fixtures for unit tests.

use crate::config::{AiDispatch, BridgeConfig};
use crate::http_auth::AdminAuthPolicy;
use crate::routes;
use crate::server::AppState;
use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::Request;
use axum::response::Response;
use bridge_channels::{
    AdapterRegistry, FileStorage, MessageType, NormalizedMessage, PlatformAdapter, PlatformType,
    PlatformUserId, RemoteFile, StoredFile, WebhookAuth,
};
use bridge_store::{NewEmployee, Store};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::util::ServiceExt;

pub async fn store_with_employee() -> (Store, i64) {
    let store = Store::open_in_memory().await.expect("store");
    let employee = store
        .insert_employee(NewEmployee {
            name: "Alice Zhang".to_string(),
            email: Some("alice@example.com".to_string()),
            ..NewEmployee::default()
        })
        .await
        .expect("employee");
    (store, employee.id)
}

pub fn text_message(platform: PlatformType, user: &str, text: &str) -> NormalizedMessage {
    NormalizedMessage {
        platform_type: platform,
        platform_user_id: PlatformUserId::new(user),
        platform_username: Some(format!("user_{user}")),
        text: text.to_string(),
        message_type: MessageType::Text,
        file: None,
        platform_message_id: None,
        received_at: Utc::now(),
    }
}

/// Adapter that records outbound sends instead of calling a platform.
pub struct RecordingAdapter {
    platform: PlatformType,
    pub sent: Mutex<Vec<(String, String)>>,
    fail_sends: bool,
    stall_downloads: bool,
    stored_file: Option<StoredFile>,
}

impl RecordingAdapter {
    pub fn new(platform: PlatformType) -> Self {
        Self {
            platform,
            sent: Mutex::new(Vec::new()),
            fail_sends: false,
            stall_downloads: false,
            stored_file: None,
        }
    }

    pub fn failing(platform: PlatformType) -> Self {
        Self {
            fail_sends: true,
            ..Self::new(platform)
        }
    }

    /// Downloads never finish.
    pub fn stalling_downloads(mut self) -> Self {
        self.stall_downloads = true;
        self
    }

    pub fn with_stored_file(mut self, file: StoredFile) -> Self {
        self.stored_file = Some(file);
        self
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("sent lock")
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl PlatformAdapter for RecordingAdapter {
    fn platform_type(&self) -> PlatformType {
        self.platform
    }

    fn parse_incoming(&self, payload: &[u8]) -> Option<NormalizedMessage> {
        let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
        Some(text_message(
            self.platform,
            value.get("user")?.as_str()?,
            value.get("text")?.as_str()?,
        ))
    }

    async fn send(&self, platform_user_id: &str, text: &str) -> anyhow::Result<()> {
        if self.fail_sends {
            return Err(anyhow::anyhow!("platform unavailable"));
        }
        self.sent
            .lock()
            .expect("sent lock")
            .push((platform_user_id.to_string(), text.to_string()));
        Ok(())
    }

    fn validate_signature(&self, auth: &WebhookAuth) -> bool {
        auth.secret_header.as_deref() != Some("wrong")
    }

    async fn fetch_file(&self, _file: &RemoteFile, _storage: &FileStorage) -> Option<StoredFile> {
        if self.stall_downloads {
            std::future::pending::<()>().await;
        }
        self.stored_file.clone()
    }
}

/// The full HTTP app over an in-memory store, with admin auth left open.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub app: Router,
    pub employee_id: i64,
    pub adapter: Option<Arc<RecordingAdapter>>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::build(Self::config(), None).await
    }

    pub async fn with_adapter(adapter: RecordingAdapter) -> Self {
        Self::build(Self::config(), Some(adapter)).await
    }

    pub fn config() -> BridgeConfig {
        let mut cfg = BridgeConfig::default();
        cfg.security.allow_insecure_admin = true;
        cfg.ai.dispatch = AiDispatch::Polling;
        cfg
    }

    pub async fn build(cfg: BridgeConfig, adapter: Option<RecordingAdapter>) -> Self {
        let (store, employee_id) = store_with_employee().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let adapters = AdapterRegistry::new();
        let adapter = adapter.map(Arc::new);
        if let Some(adapter) = &adapter {
            adapters.insert(adapter.clone());
        }
        let state = Arc::new(
            AppState::new(&cfg, store, adapters, FileStorage::new(dir.path()))
                .expect("state"),
        );
        let app = routes::router(
            state.clone(),
            AdminAuthPolicy::from_config(&cfg),
        );
        Self {
            state,
            app,
            employee_id,
            adapter,
            _dir: dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.expect("response")
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.send(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> Response {
        self.send_json("POST", uri, body).await
    }

    pub async fn send_json(
        &self,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> Response {
        self.send(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .expect("request"),
        )
        .await
    }

    pub async fn json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&body).expect("json body")
    }

    pub async fn text(response: Response) -> String {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        String::from_utf8(body.to_vec()).expect("utf8 body")
    }
}
