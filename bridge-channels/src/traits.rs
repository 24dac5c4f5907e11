use crate::storage::FileStorage;
use crate::types::{NormalizedMessage, PlatformType, RemoteFile, StoredFile, WebhookAuth};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform_type(&self) -> PlatformType;

    /// Normalize a raw webhook body. `None` means "nothing to route" and is not an error.
    fn parse_incoming(&self, payload: &[u8]) -> Option<NormalizedMessage>;

    /// Deliver text to a platform user, splitting it when the platform imposes a length limit.
    async fn send(&self, platform_user_id: &str, text: &str) -> Result<()>;

    fn validate_signature(&self, auth: &WebhookAuth) -> bool;

    /// Download a remote attachment into local storage. Failures degrade to `None`.
    async fn fetch_file(&self, _file: &RemoteFile, _storage: &FileStorage) -> Option<StoredFile> {
        None
    }
}
