use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum lifetime granted to a token even when the platform reports a tiny `expires_in`.
const MIN_REUSE: Duration = Duration::from_secs(60);

/// A freshly issued platform access token.
#[derive(Debug, Clone)]
pub struct FetchedToken {
    pub token: String,
    pub expires_in: Duration,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Single access token shared by every sender of one adapter.
///
/// The token is served until `expires_in - leeway` has elapsed. The refresh runs while the lock is
/// held, so callers racing past expiry wait for one fetch instead of each issuing their own.
#[derive(Debug)]
pub struct AccessTokenCache {
    leeway: Duration,
    slot: Mutex<Option<CachedToken>>,
}

impl AccessTokenCache {
    pub fn new(leeway: Duration) -> Self {
        Self {
            leeway,
            slot: Mutex::new(None),
        }
    }

    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchedToken>>,
    {
        let mut slot = self.slot.lock().await;
        let now = Instant::now();
        if let Some(cached) = slot.as_ref() {
            if now < cached.refresh_at {
                return Ok(cached.token.clone());
            }
        }

        let fetched = fetch().await?;
        let refresh_at = now + usable_lifetime(fetched.expires_in, self.leeway);
        tracing::debug!(
            expires_in_secs = fetched.expires_in.as_secs(),
            "access token refreshed"
        );
        *slot = Some(CachedToken {
            token: fetched.token.clone(),
            refresh_at,
        });
        Ok(fetched.token)
    }

    /// Drops the cached token if it is still `rejected`, so the next caller fetches a new one.
    /// Returns `false` when another caller already replaced it.
    pub async fn invalidate(&self, rejected: &str) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|cached| cached.token == rejected) {
            slot.take();
            return true;
        }
        false
    }
}

fn usable_lifetime(expires_in: Duration, leeway: Duration) -> Duration {
    expires_in.saturating_sub(leeway).max(MIN_REUSE)
}
