//! Bridge configuration loader.
//!
//! TOML file, then environment overrides, then validation.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub binding: BindingConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub wechat: WechatConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    60
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file; `~/` is expanded.
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "~/.erp-bridge/data/bridge.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for downloaded attachments.
    #[serde(default = "default_storage_root")]
    pub root: String,
}

fn default_storage_root() -> String {
    "~/.erp-bridge/files".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindingConfig {
    #[serde(default = "default_code_ttl_minutes")]
    pub code_ttl_minutes: i64,
    #[serde(default = "default_purge_interval_seconds")]
    pub purge_interval_seconds: u64,
}

fn default_code_ttl_minutes() -> i64 {
    30
}

fn default_purge_interval_seconds() -> u64 {
    300
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            code_ttl_minutes: default_code_ttl_minutes(),
            purge_interval_seconds: default_purge_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_rate_limit_max_messages")]
    pub rate_limit_max_messages: u64,
    #[serde(default = "default_rate_limit_window_seconds")]
    pub rate_limit_window_seconds: i64,
}

fn default_rate_limit_max_messages() -> u64 {
    20
}

fn default_rate_limit_window_seconds() -> i64 {
    60
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            rate_limit_max_messages: default_rate_limit_max_messages(),
            rate_limit_window_seconds: default_rate_limit_window_seconds(),
        }
    }
}

/// Who produces AI replies for PENDING messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiDispatch {
    /// An external client polls `/messages/pending` and posts replies back.
    Polling,
    /// The in-process worker pool answers through the async task queue.
    #[default]
    Worker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_ai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_ai_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_ai_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub dispatch: AiDispatch,
}

fn default_ai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_system_prompt() -> String {
    "You are the company ERP assistant. Answer employees briefly and in plain text.".to_string()
}

fn default_ai_timeout_seconds() -> u64 {
    30
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: default_ai_base_url(),
            api_key: None,
            model: default_ai_model(),
            system_prompt: default_system_prompt(),
            timeout_seconds: default_ai_timeout_seconds(),
            dispatch: AiDispatch::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_worker_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_worker_poll_interval_ms() -> u64 {
    1000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_worker_concurrency(),
            poll_interval_ms: default_worker_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Empty string sends plain text only.
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
    #[serde(default = "default_platform_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_parse_mode() -> String {
    "Markdown".to_string()
}

fn default_platform_timeout_seconds() -> u64 {
    15
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            webhook_secret: None,
            api_base_url: None,
            parse_mode: default_parse_mode(),
            timeout_seconds: default_platform_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WechatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    /// Token shared with the WeChat console for webhook signatures.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default = "default_platform_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for WechatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            app_id: String::new(),
            app_secret: String::new(),
            token: String::new(),
            api_base_url: None,
            timeout_seconds: default_platform_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// Bearer tokens accepted on mutating admin requests.
    #[serde(default)]
    pub admin_api_keys: Vec<String>,
    /// Let mutating admin requests through without a bearer token. Local development only.
    #[serde(default)]
    pub allow_insecure_admin: bool,
}

impl BridgeConfig {
    /// Loads `path`, or the default location. A missing default file falls back to built-in
    /// defaults so the bridge can be configured purely through the environment.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml_str(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    config_path = %path.display(),
                    "config file not found; using defaults and environment"
                );
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("ERP_BRIDGE_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = var("ERP_BRIDGE_DATABASE_PATH") {
            self.database.path = v;
        }
        if let Some(v) = var("ERP_BRIDGE_AI_API_KEY").or_else(|| var("OPENAI_API_KEY")) {
            self.ai.api_key = Some(v);
        }
        if let Some(v) = var("ERP_BRIDGE_AI_MODEL") {
            self.ai.model = v;
        }
        if let Some(v) = var("ERP_BRIDGE_AI_BASE_URL") {
            self.ai.base_url = v;
        }
        if let Some(v) = var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
            self.telegram.enabled = true;
        }
        if let Some(v) = var("TELEGRAM_WEBHOOK_SECRET") {
            self.telegram.webhook_secret = Some(v);
        }
        if let (Some(app_id), Some(app_secret), Some(token)) = (
            var("WECHAT_APP_ID"),
            var("WECHAT_APP_SECRET"),
            var("WECHAT_TOKEN"),
        ) {
            self.wechat.app_id = app_id;
            self.wechat.app_secret = app_secret;
            self.wechat.token = token;
            self.wechat.enabled = true;
        }
        if let Some(v) = var("ERP_BRIDGE_ADMIN_API_KEY") {
            let v = v.trim().to_string();
            if !self.security.admin_api_keys.contains(&v) {
                self.security.admin_api_keys.push(v);
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.database.path.trim().is_empty() {
            return Err(anyhow::anyhow!("database.path is required"));
        }
        if self.storage.root.trim().is_empty() {
            return Err(anyhow::anyhow!("storage.root is required"));
        }
        if self.binding.code_ttl_minutes <= 0 {
            return Err(anyhow::anyhow!("binding.code_ttl_minutes must be > 0"));
        }
        if self.binding.purge_interval_seconds == 0 {
            return Err(anyhow::anyhow!("binding.purge_interval_seconds must be > 0"));
        }
        if self.router.rate_limit_max_messages == 0 {
            return Err(anyhow::anyhow!("router.rate_limit_max_messages must be > 0"));
        }
        if self.router.rate_limit_window_seconds <= 0 {
            return Err(anyhow::anyhow!("router.rate_limit_window_seconds must be > 0"));
        }
        if self.ai.model.trim().is_empty() {
            return Err(anyhow::anyhow!("ai.model is required"));
        }
        if self.ai.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("ai.timeout_seconds must be > 0"));
        }
        if self.worker.concurrency == 0 {
            return Err(anyhow::anyhow!("worker.concurrency must be > 0"));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("worker.poll_interval_ms must be > 0"));
        }
        if self.telegram.enabled {
            if self.telegram.bot_token.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "telegram.bot_token is required when telegram is enabled"
                ));
            }
            if self.telegram.timeout_seconds == 0 {
                return Err(anyhow::anyhow!("telegram.timeout_seconds must be > 0"));
            }
        }
        if self.wechat.enabled {
            for (name, value) in [
                ("wechat.app_id", &self.wechat.app_id),
                ("wechat.app_secret", &self.wechat.app_secret),
                ("wechat.token", &self.wechat.token),
            ] {
                if value.trim().is_empty() {
                    return Err(anyhow::anyhow!("{name} is required when wechat is enabled"));
                }
            }
            if self.wechat.timeout_seconds == 0 {
                return Err(anyhow::anyhow!("wechat.timeout_seconds must be > 0"));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| {
                anyhow::anyhow!("invalid server.bind_addr {:?}: {e}", self.server.bind_addr)
            })
    }

    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.database.path)
    }

    pub fn storage_root(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.storage.root)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".erp-bridge").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}
