//! Platform configuration bootstrap: seeds `platform_configs` from the file config and keeps the
//! adapter registry in step with the stored rows.

use crate::config::BridgeConfig;
use bridge_channels::{AdapterRegistry, PlatformType, TelegramAdapter, WechatAdapter};
use bridge_store::{PlatformConfig, PlatformConfigUpdate, Store};
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PLATFORM_TIMEOUT_SECONDS: u64 = 15;
const SECRET_KEYS: &[&str] = &["bot_token", "webhook_secret", "app_secret", "token"];
const REDACTED: &str = "********";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Process startup: resolve the bot username only when unknown.
    Startup,
    /// Admin update: always refresh the bot username and register the webhook.
    Reconfigure,
}

/// Inserts a row for every platform enabled in the file config that has none yet.
/// Existing rows are admin-managed and left alone.
#[tracing::instrument(level = "info", skip_all)]
pub async fn seed_platform_configs(store: &Store, cfg: &BridgeConfig) -> anyhow::Result<usize> {
    let mut seeded = 0;
    for (platform, config_data) in file_platform_configs(cfg) {
        if store.get_platform_config(platform).await?.is_some() {
            continue;
        }
        store
            .upsert_platform_config(
                platform,
                PlatformConfigUpdate {
                    platform_name: None,
                    config_data,
                    webhook_url: None,
                    is_enabled: true,
                },
                Utc::now(),
            )
            .await?;
        tracing::info!(platform = %platform, "platform config seeded from file config");
        seeded += 1;
    }
    Ok(seeded)
}

fn file_platform_configs(cfg: &BridgeConfig) -> Vec<(PlatformType, Map<String, Value>)> {
    let mut out = Vec::new();
    if cfg.telegram.enabled {
        let mut data = Map::new();
        data.insert("bot_token".into(), json!(cfg.telegram.bot_token.trim()));
        data.insert("parse_mode".into(), json!(cfg.telegram.parse_mode.trim()));
        data.insert("timeout_seconds".into(), json!(cfg.telegram.timeout_seconds));
        if let Some(secret) = cfg.telegram.webhook_secret.as_deref() {
            data.insert("webhook_secret".into(), json!(secret.trim()));
        }
        if let Some(base) = cfg.telegram.api_base_url.as_deref() {
            data.insert("api_base_url".into(), json!(base.trim()));
        }
        out.push((PlatformType::Telegram, data));
    }
    if cfg.wechat.enabled {
        let mut data = Map::new();
        data.insert("app_id".into(), json!(cfg.wechat.app_id.trim()));
        data.insert("app_secret".into(), json!(cfg.wechat.app_secret.trim()));
        data.insert("token".into(), json!(cfg.wechat.token.trim()));
        data.insert("timeout_seconds".into(), json!(cfg.wechat.timeout_seconds));
        if let Some(base) = cfg.wechat.api_base_url.as_deref() {
            data.insert("api_base_url".into(), json!(base.trim()));
        }
        out.push((PlatformType::Wechat, data));
    }
    out
}

/// Builds adapters for every enabled row. A row that cannot produce an adapter is logged and
/// skipped so one bad credential set does not keep the other platform down.
#[tracing::instrument(level = "info", skip_all)]
pub async fn load_adapters(store: &Store, registry: &AdapterRegistry) -> anyhow::Result<()> {
    for config in store.list_platform_configs().await? {
        let platform = config.platform_type;
        if !config.is_enabled {
            continue;
        }
        if let Err(e) = activate_platform(store, registry, config, Activation::Startup).await {
            tracing::error!(platform = %platform, error = %e, "platform adapter not started");
        }
    }
    tracing::info!(platforms = ?registry.platforms(), "platform adapters loaded");
    Ok(())
}

/// Replaces the registry entry for `config.platform_type` and returns the row as stored
/// afterwards. Identity lookup and webhook registration are best effort.
#[tracing::instrument(level = "info", skip_all, fields(platform = %config.platform_type))]
pub async fn activate_platform(
    store: &Store,
    registry: &AdapterRegistry,
    config: PlatformConfig,
    activation: Activation,
) -> anyhow::Result<PlatformConfig> {
    if !config.is_enabled {
        registry.remove(config.platform_type);
        tracing::info!("platform disabled; adapter removed");
        return Ok(config);
    }

    match config.platform_type {
        PlatformType::Telegram => {
            let adapter = build_telegram(&config)?;
            let mut config = config;
            let needs_identity = activation == Activation::Reconfigure
                || config.config_str("bot_username").is_none();
            if needs_identity {
                match adapter.get_me().await {
                    Ok(Some(username)) => {
                        config = store
                            .set_platform_config_value(
                                PlatformType::Telegram,
                                "bot_username",
                                json!(username),
                                Utc::now(),
                            )
                            .await?;
                        tracing::info!(bot_username = %username, "telegram bot identity resolved");
                    }
                    Ok(None) => tracing::warn!("telegram getMe returned no username"),
                    Err(e) => tracing::warn!(error = %e, "telegram getMe failed"),
                }
            }
            if activation == Activation::Reconfigure {
                if let Some(url) = config.webhook_url.as_deref() {
                    match adapter
                        .set_webhook(url, config.config_str("webhook_secret"))
                        .await
                    {
                        Ok(()) => tracing::info!(webhook_url = %url, "telegram webhook registered"),
                        Err(e) => tracing::warn!(error = %e, "telegram setWebhook failed"),
                    }
                }
            }
            registry.insert(Arc::new(adapter));
            Ok(config)
        }
        PlatformType::Wechat => {
            let adapter = build_wechat(&config)?;
            registry.insert(Arc::new(adapter));
            Ok(config)
        }
    }
}

pub fn build_telegram(config: &PlatformConfig) -> anyhow::Result<TelegramAdapter> {
    let token = config
        .config_str("bot_token")
        .ok_or_else(|| anyhow::anyhow!("telegram config_data.bot_token is required"))?;
    let mut adapter = TelegramAdapter::new(token)?
        .with_webhook_secret(config.config_str("webhook_secret"))
        .with_timeout(platform_timeout(config))?;
    // An absent key keeps the adapter default; an empty one means plain text.
    if let Some(mode) = config.config_data.get("parse_mode").and_then(Value::as_str) {
        adapter = adapter.with_parse_mode(Some(mode));
    }
    if let Some(base) = config.config_str("api_base_url") {
        adapter = adapter.with_api_base(base);
    }
    Ok(adapter)
}

pub fn build_wechat(config: &PlatformConfig) -> anyhow::Result<WechatAdapter> {
    let field = |key: &str| {
        config
            .config_str(key)
            .ok_or_else(|| anyhow::anyhow!("wechat config_data.{key} is required"))
    };
    let mut adapter = WechatAdapter::new(field("app_id")?, field("app_secret")?, field("token")?)?
        .with_timeout(platform_timeout(config))?;
    if let Some(base) = config.config_str("api_base_url") {
        adapter = adapter.with_api_base(base);
    }
    Ok(adapter)
}

fn platform_timeout(config: &PlatformConfig) -> Duration {
    let seconds = config
        .config_data
        .get("timeout_seconds")
        .and_then(Value::as_u64)
        .filter(|s| *s > 0)
        .unwrap_or(DEFAULT_PLATFORM_TIMEOUT_SECONDS);
    Duration::from_secs(seconds)
}

/// Copy of `config` with credential values masked for API responses.
pub fn redact(config: &PlatformConfig) -> PlatformConfig {
    let mut redacted = config.clone();
    for key in SECRET_KEYS {
        if let Some(value) = redacted.config_data.get_mut(*key) {
            if value.as_str().is_some_and(|s| !s.is_empty()) {
                *value = json!(REDACTED);
            }
        }
    }
    redacted
}

/// Puts stored secrets back where an update echoes the masked placeholder.
pub fn restore_redacted(update: &mut Map<String, Value>, existing: Option<&PlatformConfig>) {
    for key in SECRET_KEYS {
        if update.get(*key).and_then(Value::as_str) != Some(REDACTED) {
            continue;
        }
        match existing.and_then(|config| config.config_data.get(*key)) {
            Some(stored) => {
                update.insert((*key).to_string(), stored.clone());
            }
            None => {
                update.remove(*key);
            }
        }
    }
}
