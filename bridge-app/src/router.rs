//! Message router: turns each normalized inbound message into exactly one INBOUND log row and
//! resolves it through the binding, rate-limit and dispatch rules.

use crate::binding::BindingManager;
use crate::commands::{BotCommand, parse_command};
use crate::config::AiDispatch;
use crate::worker::TaskQueue;
use bridge_channels::{
    AdapterRegistry, FileStorage, NormalizedMessage, PlatformAdapter, PlatformType,
};
use bridge_store::{
    MessageDirection, MessageLog, NewMessageLog, PlatformIdentity, ProcessingStatus, Store,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub const BOUND_REPLY: &str =
    "Your account is now linked. Send me a message any time and I will reply here.";
pub const INVALID_CODE_REPLY: &str =
    "That bind code is invalid or has expired. Please request a new code in the ERP portal.";
pub const HELP_REPLY: &str = "Welcome to the ERP assistant. To link your account, request a bind \
     code in the ERP portal and send /bind <code> here.";
pub const BIND_USAGE_REPLY: &str = "Usage: /bind <code>. Request a code in the ERP portal first.";
pub const NOT_BOUND_REPLY: &str = "Your account is not linked yet. Request a bind code in the ERP \
     portal and send /bind <code> to get started.";
pub const RATE_LIMIT_REPLY: &str =
    "You are sending messages too quickly. Please wait a minute and try again.";

pub const INVALID_CODE_ERROR: &str = "invalid or expired code";
pub const NOT_BOUND_ERROR: &str = "user not bound";
pub const RATE_LIMIT_ERROR: &str = "rate limit exceeded";

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub rate_limit_max_messages: u64,
    pub rate_limit_window: Duration,
    pub dispatch: AiDispatch,
}

#[derive(Clone)]
pub struct MessageRouter {
    store: Store,
    bindings: BindingManager,
    adapters: AdapterRegistry,
    storage: FileStorage,
    queue: TaskQueue,
    settings: Arc<RouterSettings>,
}

impl MessageRouter {
    pub fn new(
        store: Store,
        bindings: BindingManager,
        adapters: AdapterRegistry,
        storage: FileStorage,
        queue: TaskQueue,
        settings: RouterSettings,
    ) -> Self {
        Self {
            store,
            bindings,
            adapters,
            storage,
            queue,
            settings: Arc::new(settings),
        }
    }

    /// Logs and resolves one inbound message. Returns the inbound row in its resolved state.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(platform = %message.platform_type, platform_user_id = %message.platform_user_id)
    )]
    pub async fn route(&self, message: NormalizedMessage) -> anyhow::Result<MessageLog> {
        let adapter = self.adapters.get(message.platform_type);
        let now = Utc::now();
        let inbound = self
            .store
            .insert_message_log(NewMessageLog {
                binding_id: None,
                platform_type: message.platform_type,
                platform_user_id: message.platform_user_id.as_str().to_string(),
                platform_message_id: message.platform_message_id.clone(),
                direction: MessageDirection::Inbound,
                content: message.text.clone(),
                message_type: message.message_type,
                file: None,
                processing_status: ProcessingStatus::Received,
                error_message: None,
                created_at: now,
            })
            .await?;
        tracing::debug!(message_log_id = inbound.id, "inbound message logged");

        if let (Some(remote), Some(adapter)) = (&message.file, &adapter) {
            if let Some(file) = adapter.fetch_file(remote, &self.storage).await {
                self.store.set_message_file(inbound.id, file).await?;
            }
        }

        let ctx = ReplyContext {
            adapter: adapter.as_deref(),
            platform: message.platform_type,
            platform_user_id: message.platform_user_id.as_str(),
        };

        match parse_command(&message.text) {
            Some(BotCommand::Redeem(code)) => {
                let identity = PlatformIdentity {
                    platform_type: message.platform_type,
                    platform_user_id: message.platform_user_id.as_str().to_string(),
                    platform_username: message.platform_username.clone(),
                };
                match self.bindings.redeem_code(&code, identity, now).await? {
                    Some(binding) => {
                        self.reply(&ctx, Some(binding.id), BOUND_REPLY).await;
                        self.resolve(inbound.id, ProcessingStatus::Completed, None).await
                    }
                    None => {
                        self.reply(&ctx, None, INVALID_CODE_REPLY).await;
                        self.resolve(inbound.id, ProcessingStatus::Failed, Some(INVALID_CODE_ERROR))
                            .await
                    }
                }
            }
            Some(BotCommand::Help) => {
                self.reply(&ctx, None, HELP_REPLY).await;
                self.resolve(inbound.id, ProcessingStatus::Completed, None).await
            }
            Some(BotCommand::BindUsage) => {
                self.reply(&ctx, None, BIND_USAGE_REPLY).await;
                self.resolve(inbound.id, ProcessingStatus::Completed, None).await
            }
            None => self.route_chat(&ctx, inbound, now).await,
        }
    }

    async fn route_chat(
        &self,
        ctx: &ReplyContext<'_>,
        inbound: MessageLog,
        now: DateTime<Utc>,
    ) -> anyhow::Result<MessageLog> {
        let Some(binding) = self
            .bindings
            .find_active_binding(ctx.platform, ctx.platform_user_id)
            .await?
        else {
            self.reply(ctx, None, NOT_BOUND_REPLY).await;
            return self
                .resolve(inbound.id, ProcessingStatus::Failed, Some(NOT_BOUND_ERROR))
                .await;
        };
        self.store.set_message_binding(inbound.id, binding.id).await?;

        let since = now - self.settings.rate_limit_window;
        let recent = self
            .store
            .count_inbound_since(binding.id, since, Some(inbound.id))
            .await?;
        if recent >= self.settings.rate_limit_max_messages {
            tracing::info!(binding_id = binding.id, recent, "rate limit exceeded");
            self.reply(ctx, Some(binding.id), RATE_LIMIT_REPLY).await;
            return self
                .resolve(inbound.id, ProcessingStatus::Failed, Some(RATE_LIMIT_ERROR))
                .await;
        }

        let pending = self
            .resolve(inbound.id, ProcessingStatus::Pending, None)
            .await?;
        if self.settings.dispatch == AiDispatch::Worker {
            self.queue
                .enqueue_ai_reply(binding.id, pending.id, &pending.content)
                .await?;
        }
        tracing::info!(
            message_log_id = pending.id,
            binding_id = binding.id,
            dispatch = ?self.settings.dispatch,
            "message awaiting ai reply"
        );
        Ok(pending)
    }

    async fn resolve(
        &self,
        id: i64,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> anyhow::Result<MessageLog> {
        Ok(self
            .store
            .update_message_status(id, status, error, Utc::now())
            .await?)
    }

    /// Sends a bot reply and logs it as OUTBOUND. Failures are logged, never propagated.
    async fn reply(&self, ctx: &ReplyContext<'_>, binding_id: Option<i64>, text: &str) {
        let mut outbound = NewMessageLog::outbound(
            binding_id,
            ctx.platform,
            ctx.platform_user_id,
            text,
            Utc::now(),
        );
        let sent = match ctx.adapter {
            Some(adapter) => adapter.send(ctx.platform_user_id, text).await,
            None => Err(anyhow::anyhow!("no adapter configured for {}", ctx.platform)),
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "bot reply failed");
            outbound.processing_status = ProcessingStatus::Failed;
            outbound.error_message = Some(e.to_string());
        }
        if let Err(e) = self.store.insert_message_log(outbound).await {
            tracing::warn!(error = %e, "bot reply could not be logged");
        }
    }
}

struct ReplyContext<'a> {
    adapter: Option<&'a dyn PlatformAdapter>,
    platform: PlatformType,
    platform_user_id: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingAdapter, store_with_employee, text_message};
    use bridge_channels::{MessageType, RemoteFile, StoredFile};
    use bridge_store::{BindingStatus, MessageFilter, TaskStatus};

    struct Fixture {
        store: Store,
        router: MessageRouter,
        bindings: BindingManager,
        adapter: Arc<RecordingAdapter>,
        employee_id: i64,
        _dir: tempfile::TempDir,
    }

    async fn fixture_with(adapter: RecordingAdapter, dispatch: AiDispatch) -> Fixture {
        let (store, employee_id) = store_with_employee().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let bindings = BindingManager::new(store.clone(), Duration::minutes(30))
            .with_code_source(|| "AB3C7XYZ".to_string());
        let adapter = Arc::new(adapter);
        let adapters = AdapterRegistry::new();
        adapters.insert(adapter.clone());
        let router = MessageRouter::new(
            store.clone(),
            bindings.clone(),
            adapters,
            FileStorage::new(dir.path()),
            TaskQueue::new(store.clone()),
            RouterSettings {
                rate_limit_max_messages: 20,
                rate_limit_window: Duration::seconds(60),
                dispatch,
            },
        );
        Fixture {
            store,
            router,
            bindings,
            adapter,
            employee_id,
            _dir: dir,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(RecordingAdapter::new(PlatformType::Telegram), AiDispatch::Polling).await
    }

    async fn bind(f: &Fixture, user: &str) {
        let issued = f.bindings.generate_code(f.employee_id, None).await.expect("code");
        let row = f
            .router
            .route(text_message(PlatformType::Telegram, user, &format!("/start {}", issued.code)))
            .await
            .expect("route");
        assert_eq!(row.processing_status, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn end_to_end_bind_then_chat_is_pending() {
        let f = fixture().await;
        let issued = f.bindings.generate_code(f.employee_id, None).await.expect("code");
        assert_eq!(issued.code, "AB3C7XYZ");
        let ttl = issued.expires_at - Utc::now();
        assert!(ttl > Duration::minutes(29) && ttl <= Duration::minutes(30));

        let bind_row = f
            .router
            .route(text_message(PlatformType::Telegram, "12345", "/start AB3C7XYZ"))
            .await
            .expect("bind");
        assert_eq!(bind_row.processing_status, ProcessingStatus::Completed);

        let binding = f
            .bindings
            .find_active_binding(PlatformType::Telegram, "12345")
            .await
            .expect("lookup")
            .expect("active");
        assert_eq!(binding.status, BindingStatus::Active);
        assert_eq!(binding.employee_id, f.employee_id);
        // Command rows stay outside the binding's rate-limit window.
        assert_eq!(bind_row.binding_id, None);

        let hello = f
            .router
            .route(text_message(PlatformType::Telegram, "12345", "hello"))
            .await
            .expect("hello");
        assert_eq!(hello.processing_status, ProcessingStatus::Pending);
        assert_eq!(hello.binding_id, Some(binding.id));
        assert_eq!(hello.content, "hello");
        assert_eq!(f.adapter.sent_texts(), vec![BOUND_REPLY.to_string()]);
    }

    #[tokio::test]
    async fn reused_code_fails() {
        let f = fixture().await;
        bind(&f, "12345").await;
        let second = f
            .router
            .route(text_message(PlatformType::Telegram, "999", "/bind AB3C7XYZ"))
            .await
            .expect("route");
        assert_eq!(second.processing_status, ProcessingStatus::Failed);
        assert_eq!(second.error_message.as_deref(), Some(INVALID_CODE_ERROR));
        assert_eq!(second.binding_id, None);
        assert_eq!(f.adapter.sent_texts().last().map(String::as_str), Some(INVALID_CODE_REPLY));
    }

    #[tokio::test]
    async fn bare_commands_complete_with_help() {
        let f = fixture().await;
        let start = f
            .router
            .route(text_message(PlatformType::Telegram, "1", "/start"))
            .await
            .expect("start");
        let bind = f
            .router
            .route(text_message(PlatformType::Telegram, "1", "/bind"))
            .await
            .expect("bind");
        assert_eq!(start.processing_status, ProcessingStatus::Completed);
        assert_eq!(bind.processing_status, ProcessingStatus::Completed);
        assert_eq!(
            f.adapter.sent_texts(),
            vec![HELP_REPLY.to_string(), BIND_USAGE_REPLY.to_string()]
        );
    }

    #[tokio::test]
    async fn unbound_user_is_failed_not_queued() {
        let f = fixture_with(
            RecordingAdapter::new(PlatformType::Telegram),
            AiDispatch::Worker,
        )
        .await;
        let row = f
            .router
            .route(text_message(PlatformType::Telegram, "404", "hello"))
            .await
            .expect("route");
        assert_eq!(row.processing_status, ProcessingStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some(NOT_BOUND_ERROR));
        assert!(row.processed_at.is_some());
        assert_eq!(f.store.pending_task_count().await.expect("count"), 0);
        assert_eq!(f.adapter.sent_texts(), vec![NOT_BOUND_REPLY.to_string()]);
    }

    #[tokio::test]
    async fn twenty_first_message_in_window_is_rate_limited() {
        let f = fixture().await;
        bind(&f, "12345").await;
        for i in 0..20 {
            let row = f
                .router
                .route(text_message(PlatformType::Telegram, "12345", &format!("msg {i}")))
                .await
                .expect("route");
            assert_eq!(row.processing_status, ProcessingStatus::Pending, "message {i}");
        }
        let limited = f
            .router
            .route(text_message(PlatformType::Telegram, "12345", "one too many"))
            .await
            .expect("route");
        assert_eq!(limited.processing_status, ProcessingStatus::Failed);
        assert_eq!(limited.error_message.as_deref(), Some(RATE_LIMIT_ERROR));
        assert_eq!(f.adapter.sent_texts().last().map(String::as_str), Some(RATE_LIMIT_REPLY));
    }

    #[tokio::test]
    async fn worker_dispatch_enqueues_task() {
        let f = fixture_with(
            RecordingAdapter::new(PlatformType::Telegram),
            AiDispatch::Worker,
        )
        .await;
        bind(&f, "12345").await;
        let row = f
            .router
            .route(text_message(PlatformType::Telegram, "12345", "hello"))
            .await
            .expect("route");
        assert_eq!(row.processing_status, ProcessingStatus::Pending);

        let task = f
            .store
            .claim_next_task(Utc::now())
            .await
            .expect("claim")
            .expect("task queued");
        assert_eq!(task.task_type, crate::worker::AI_REPLY_TASK);
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.input_data["message_log_id"], serde_json::json!(row.id));
        assert_eq!(task.input_data["text"], serde_json::json!("hello"));
    }

    #[tokio::test]
    async fn send_failure_is_logged_without_changing_resolution() {
        let f = fixture_with(
            RecordingAdapter::failing(PlatformType::Telegram),
            AiDispatch::Polling,
        )
        .await;
        let row = f
            .router
            .route(text_message(PlatformType::Telegram, "1", "/start"))
            .await
            .expect("route");
        assert_eq!(row.processing_status, ProcessingStatus::Completed);

        let outbound = f
            .store
            .list_message_logs(
                MessageFilter {
                    direction: Some(MessageDirection::Outbound),
                    ..MessageFilter::default()
                },
                0,
                10,
            )
            .await
            .expect("outbound");
        assert_eq!(outbound.total, 1);
        assert_eq!(outbound.items[0].processing_status, ProcessingStatus::Failed);
        assert_eq!(
            outbound.items[0].error_message.as_deref(),
            Some("platform unavailable")
        );
    }

    #[tokio::test]
    async fn attachment_is_recorded_on_inbound_row() {
        let stored = StoredFile {
            relative_path: "2026/10/16/01hx.jpg".to_string(),
            file_name: "photo.jpg".to_string(),
            file_type: "image/jpeg".to_string(),
        };
        let f = fixture_with(
            RecordingAdapter::new(PlatformType::Telegram).with_stored_file(stored),
            AiDispatch::Polling,
        )
        .await;
        let mut message = text_message(PlatformType::Telegram, "1", "[photo]");
        message.message_type = MessageType::Photo;
        message.file = Some(RemoteFile {
            file_ref: "file-id".to_string(),
            file_name: None,
            mime_type: None,
        });
        let row = f.router.route(message).await.expect("route");
        assert_eq!(row.message_type, MessageType::Photo);
        assert_eq!(row.file_path.as_deref(), Some("2026/10/16/01hx.jpg"));
        assert_eq!(row.file_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn inbound_row_is_logged_before_attachment_download() {
        let f = fixture_with(
            RecordingAdapter::new(PlatformType::Telegram).stalling_downloads(),
            AiDispatch::Polling,
        )
        .await;
        let mut message = text_message(PlatformType::Telegram, "1", "[photo]");
        message.message_type = MessageType::Photo;
        message.file = Some(RemoteFile {
            file_ref: "file-id".to_string(),
            file_name: None,
            mime_type: None,
        });
        let routed =
            tokio::time::timeout(std::time::Duration::from_millis(200), f.router.route(message))
                .await;
        assert!(routed.is_err(), "download should still be running");

        let logged = f
            .store
            .list_message_logs(MessageFilter::default(), 0, 10)
            .await
            .expect("list");
        assert_eq!(logged.total, 1);
        assert_eq!(logged.items[0].processing_status, ProcessingStatus::Received);
        assert!(logged.items[0].file_path.is_none());
    }
}
