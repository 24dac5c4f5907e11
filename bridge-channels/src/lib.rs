//! Platform adapters for the ERP messaging bridge.
//!
//! Adapters are pure I/O: they turn platform webhook payloads into [`NormalizedMessage`]s,
//! verify webhook authenticity and deliver outbound text. Routing, bindings and persistence
//! live in `bridge-app`.

mod registry;
mod secret;
mod storage;
mod telegram;
mod token_cache;
mod traits;
mod types;
mod wechat;

pub use registry::AdapterRegistry;
pub use secret::constant_time_eq;
pub use storage::FileStorage;
pub use telegram::{TELEGRAM_MAX_MESSAGE_CHARS, TelegramAdapter, split_message};
pub use token_cache::{AccessTokenCache, FetchedToken};
pub use traits::PlatformAdapter;
pub use types::{
    MessageType, NormalizedMessage, PlatformType, PlatformUserId, RemoteFile, StoredFile,
    WebhookAuth,
};
pub use wechat::{WechatAdapter, compute_wechat_signature, verify_wechat_signature};
