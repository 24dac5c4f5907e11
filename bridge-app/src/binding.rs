//! Binding lifecycle: one-time bind codes, redemption and cleanup.

use bridge_channels::PlatformType;
use bridge_store::{Binding, PlatformIdentity, Store, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const BIND_CODE_LEN: usize = 8;
const BIND_CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
const MAX_CODE_ATTEMPTS: usize = 8;

type CodeSource = Arc<dyn Fn() -> String + Send + Sync>;

/// A freshly issued bind code.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCode {
    pub binding_id: i64,
    pub employee_id: i64,
    pub platform_type: PlatformType,
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub deep_link_url: Option<String>,
}

#[derive(Clone)]
pub struct BindingManager {
    store: Store,
    code_ttl: Duration,
    code_source: CodeSource,
}

impl BindingManager {
    pub fn new(store: Store, code_ttl: Duration) -> Self {
        Self {
            store,
            code_ttl,
            code_source: Arc::new(generate_bind_code),
        }
    }

    #[cfg(test)]
    pub fn with_code_source(mut self, source: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.code_source = Arc::new(source);
        self
    }

    /// Issues a PENDING binding for `employee_id`. Platform defaults to Telegram.
    #[tracing::instrument(level = "info", skip_all, fields(employee_id = employee_id))]
    pub async fn generate_code(
        &self,
        employee_id: i64,
        platform_type: Option<PlatformType>,
    ) -> Result<IssuedCode, StoreError> {
        let employee = self.store.get_employee(employee_id).await?;
        let platform_type = platform_type.unwrap_or(PlatformType::Telegram);
        let now = Utc::now();
        let expires_at = now + self.code_ttl;

        let mut attempt = 0;
        let binding = loop {
            attempt += 1;
            let code = (self.code_source)();
            match self
                .store
                .insert_pending_binding(employee.id, platform_type, &code, expires_at, now)
                .await
            {
                Ok(binding) => break binding,
                Err(StoreError::Conflict(reason)) if attempt < MAX_CODE_ATTEMPTS => {
                    tracing::debug!(attempt, %reason, "bind code collision; regenerating");
                }
                Err(e) => return Err(e),
            }
        };

        let code = binding.binding_code.clone().unwrap_or_default();
        let deep_link_url = self.deep_link(platform_type, &code).await;
        tracing::info!(
            binding_id = binding.id,
            platform = %platform_type,
            %expires_at,
            has_deep_link = deep_link_url.is_some(),
            "bind code issued"
        );
        Ok(IssuedCode {
            binding_id: binding.id,
            employee_id: employee.id,
            platform_type,
            code,
            expires_at,
            deep_link_url,
        })
    }

    async fn deep_link(&self, platform_type: PlatformType, code: &str) -> Option<String> {
        if platform_type != PlatformType::Telegram {
            return None;
        }
        match self.store.get_platform_config(platform_type).await {
            Ok(Some(config)) => config
                .config_str("bot_username")
                .map(|username| telegram_deep_link(username, code)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "bot username lookup failed; issuing code without deep link"
                );
                None
            }
        }
    }

    /// Activates the binding holding `code` for `identity`. `None` when the code is unknown,
    /// already used or expired.
    #[tracing::instrument(level = "info", skip_all, fields(platform = %identity.platform_type))]
    pub async fn redeem_code(
        &self,
        code: &str,
        identity: PlatformIdentity,
        now: DateTime<Utc>,
    ) -> Result<Option<Binding>, StoreError> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Ok(None);
        }
        let Some(pending) = self.store.find_binding_by_code(&code).await? else {
            tracing::info!("bind code not found");
            return Ok(None);
        };
        let expired = pending
            .code_expires_at
            .map(|expires_at| expires_at <= now)
            .unwrap_or(true);
        if expired {
            tracing::info!(binding_id = pending.id, "bind code expired");
            return Ok(None);
        }

        let activated = self
            .store
            .activate_binding(pending.id, &code, identity, now)
            .await?;
        match &activated {
            Some(binding) => tracing::info!(
                binding_id = binding.id,
                employee_id = binding.employee_id,
                "binding activated"
            ),
            None => tracing::info!(
                binding_id = pending.id,
                "bind code lost a concurrent redemption"
            ),
        }
        Ok(activated)
    }

    pub async fn find_active_binding(
        &self,
        platform_type: PlatformType,
        platform_user_id: &str,
    ) -> Result<Option<Binding>, StoreError> {
        self.store
            .find_active_binding(platform_type, platform_user_id)
            .await
    }

    #[tracing::instrument(level = "info", skip_all, fields(binding_id = binding_id))]
    pub async fn revoke(&self, binding_id: i64) -> Result<Binding, StoreError> {
        self.store.revoke_binding(binding_id).await
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let purged = self.store.purge_expired_bindings(now).await?;
        if purged > 0 {
            tracing::info!(purged, "expired bind codes purged");
        }
        Ok(purged)
    }

    pub async fn list_bindings(
        &self,
        employee_id: Option<i64>,
    ) -> Result<Vec<Binding>, StoreError> {
        self.store.list_bindings(employee_id).await
    }

    /// Purges expired PENDING bindings every `interval` until `shutdown` fires.
    pub fn spawn_purge_task(
        &self,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.purge_expired(Utc::now()).await {
                            tracing::warn!(error = %e, "periodic bind code purge failed");
                        }
                    }
                }
            }
            tracing::debug!("bind code purge task stopped");
        })
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

pub fn telegram_deep_link(bot_username: &str, code: &str) -> String {
    format!(
        "https://t.me/{}?start={code}",
        bot_username.trim().trim_start_matches('@')
    )
}

fn generate_bind_code() -> String {
    let seed = Uuid::new_v4().into_bytes();
    let mut code = String::with_capacity(BIND_CODE_LEN);
    for byte in seed.iter().take(BIND_CODE_LEN) {
        let idx = usize::from(*byte) % BIND_CODE_ALPHABET.len();
        code.push(char::from(BIND_CODE_ALPHABET[idx]));
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::store_with_employee;
    use bridge_store::{BindingStatus, PlatformConfigUpdate};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity(user: &str) -> PlatformIdentity {
        PlatformIdentity {
            platform_type: PlatformType::Telegram,
            platform_user_id: user.to_string(),
            platform_username: Some("alice".to_string()),
        }
    }

    #[test]
    fn generated_codes_use_unambiguous_alphabet() {
        for _ in 0..200 {
            let code = generate_bind_code();
            assert_eq!(code.len(), BIND_CODE_LEN);
            assert!(code.bytes().all(|b| BIND_CODE_ALPHABET.contains(&b)), "{code}");
            assert!(!code.contains(['0', '1', 'I', 'O']));
        }
    }

    #[tokio::test]
    async fn code_redeems_exactly_once() {
        let (store, employee_id) = store_with_employee().await;
        let manager = BindingManager::new(store, Duration::minutes(30));
        let issued = manager.generate_code(employee_id, None).await.expect("issue");
        assert_eq!(issued.platform_type, PlatformType::Telegram);

        let now = Utc::now();
        let bound = manager
            .redeem_code(&issued.code.to_lowercase(), identity("12345"), now)
            .await
            .expect("redeem")
            .expect("bound");
        assert_eq!(bound.status, BindingStatus::Active);
        assert_eq!(bound.employee_id, employee_id);
        assert!(bound.binding_code.is_none());

        let again = manager
            .redeem_code(&issued.code, identity("67890"), now)
            .await
            .expect("second redeem");
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn expired_code_is_rejected() {
        let (store, employee_id) = store_with_employee().await;
        let manager = BindingManager::new(store, Duration::minutes(30));
        let issued = manager.generate_code(employee_id, None).await.expect("issue");

        let later = issued.expires_at + Duration::seconds(1);
        let result = manager
            .redeem_code(&issued.code, identity("12345"), later)
            .await
            .expect("redeem");
        assert!(result.is_none());
        assert!(
            manager
                .find_active_binding(PlatformType::Telegram, "12345")
                .await
                .expect("lookup")
                .is_none()
        );
    }

    #[tokio::test]
    async fn unknown_employee_is_not_found() {
        let (store, _) = store_with_employee().await;
        let manager = BindingManager::new(store, Duration::minutes(30));
        let err = manager.generate_code(4242, None).await.expect_err("missing employee");
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn collision_regenerates_code() {
        let (store, employee_id) = store_with_employee().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let manager = BindingManager::new(store, Duration::minutes(30)).with_code_source(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                "AB3C7XYZ".to_string()
            } else {
                "QRST2345".to_string()
            }
        });
        let first = manager.generate_code(employee_id, None).await.expect("first");
        let second = manager.generate_code(employee_id, None).await.expect("second");
        assert_eq!(first.code, "AB3C7XYZ");
        assert_eq!(second.code, "QRST2345");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deep_link_uses_known_bot_username() {
        let (store, employee_id) = store_with_employee().await;
        let manager = BindingManager::new(store.clone(), Duration::minutes(30))
            .with_code_source(|| "AB3C7XYZ".to_string());
        let without = manager.generate_code(employee_id, None).await.expect("issue");
        assert!(without.deep_link_url.is_none());

        let mut data = serde_json::Map::new();
        data.insert("bot_username".into(), serde_json::json!("erp_bot"));
        store
            .upsert_platform_config(
                PlatformType::Telegram,
                PlatformConfigUpdate {
                    platform_name: None,
                    config_data: data,
                    webhook_url: None,
                    is_enabled: true,
                },
                Utc::now(),
            )
            .await
            .expect("config");
        manager.revoke(without.binding_id).await.expect("revoke");
        let with = manager.generate_code(employee_id, None).await.expect("issue");
        assert_eq!(
            with.deep_link_url.as_deref(),
            Some("https://t.me/erp_bot?start=AB3C7XYZ")
        );

        let wechat = BindingManager::new(store, Duration::minutes(30))
            .generate_code(employee_id, Some(PlatformType::Wechat))
            .await
            .expect("wechat code");
        assert!(wechat.deep_link_url.is_none());
    }

    #[tokio::test]
    async fn purge_removes_only_expired_pending() {
        let (store, employee_id) = store_with_employee().await;
        let manager = BindingManager::new(store, Duration::minutes(30));
        let issued = manager.generate_code(employee_id, None).await.expect("issue");
        assert_eq!(manager.purge_expired(Utc::now()).await.expect("purge"), 0);
        assert_eq!(
            manager
                .purge_expired(issued.expires_at + Duration::seconds(1))
                .await
                .expect("purge"),
            1
        );
        assert!(manager.list_bindings(Some(employee_id)).await.expect("list").is_empty());
    }
}
