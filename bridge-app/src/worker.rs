//! Database-backed task queue and the worker pool that answers PENDING messages with AI replies.

use bridge_channels::AdapterRegistry;
use bridge_llm::ChatCompletionClient;
use bridge_store::{
    AsyncTask, MessageLog, NewMessageLog, NewTask, ProcessingStatus, Store, StoreError,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const AI_REPLY_TASK: &str = "AI_REPLY";
pub const FAILURE_NOTICE: &str =
    "Sorry, something went wrong while processing your message. Please try again later.";
const INTERRUPTED_ERROR: &str = "interrupted by restart";

#[derive(Clone)]
pub struct TaskQueue {
    store: Store,
    notify: Arc<Notify>,
}

impl TaskQueue {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Queues an AI reply for an inbound message and wakes one idle worker.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(binding_id = binding_id, message_log_id = message_log_id)
    )]
    pub async fn enqueue_ai_reply(
        &self,
        binding_id: i64,
        message_log_id: i64,
        text: &str,
    ) -> Result<AsyncTask, StoreError> {
        let task = self
            .store
            .enqueue_task(
                NewTask {
                    binding_id,
                    task_type: AI_REPLY_TASK.to_string(),
                    priority: 0,
                    input_data: json!({ "message_log_id": message_log_id, "text": text }),
                },
                Utc::now(),
            )
            .await?;
        self.notify.notify_one();
        tracing::debug!(task_id = task.id, "ai reply task queued");
        Ok(task)
    }

    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        self.store.pending_task_count().await
    }

    async fn wait_for_work(&self, poll_interval: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub system_prompt: Option<String>,
    pub ai_timeout: Duration,
}

#[derive(Clone)]
pub struct WorkerPool {
    queue: TaskQueue,
    store: Store,
    adapters: AdapterRegistry,
    llm: ChatCompletionClient,
    settings: Arc<WorkerSettings>,
}

struct AiReplyInput {
    message_log_id: i64,
    text: String,
}

impl AiReplyInput {
    fn from_task(task: &AsyncTask) -> anyhow::Result<Self> {
        let message_log_id = task
            .input_data
            .get("message_log_id")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("task input is missing message_log_id"))?;
        let text = task
            .input_data
            .get("text")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("task input is missing text"))?
            .to_string();
        Ok(Self {
            message_log_id,
            text,
        })
    }
}

impl WorkerPool {
    pub fn new(
        queue: TaskQueue,
        adapters: AdapterRegistry,
        llm: ChatCompletionClient,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store: queue.store.clone(),
            queue,
            adapters,
            llm,
            settings: Arc::new(settings),
        }
    }

    /// Fails tasks a previous process left RUNNING. They are not re-queued.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn fail_interrupted(&self) -> Result<usize, StoreError> {
        let stale = self.store.list_running_tasks().await?;
        let now = Utc::now();
        for task in &stale {
            self.store.fail_task(task.id, INTERRUPTED_ERROR, now).await?;
            let Ok(input) = AiReplyInput::from_task(task) else {
                continue;
            };
            match self.store.get_message_log(input.message_log_id).await {
                Ok(message) if message.processing_status == ProcessingStatus::Processing => {
                    self.store
                        .update_message_status(
                            message.id,
                            ProcessingStatus::Failed,
                            Some(INTERRUPTED_ERROR),
                            now,
                        )
                        .await?;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(task_id = task.id, error = %e, "interrupted task has no message")
                }
            }
        }
        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), "failed tasks interrupted by restart");
        }
        Ok(stale.len())
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.settings.concurrency)
            .map(|worker_id| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_loop(worker_id, shutdown).await })
            })
            .collect()
    }

    #[tracing::instrument(level = "info", skip_all, fields(worker_id = worker_id))]
    async fn run_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        tracing::info!("worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "worker iteration failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue.wait_for_work(self.settings.poll_interval) => {}
            }
        }
        tracing::info!("worker stopped");
    }

    /// Claims and processes one task. Returns `false` when the queue is empty.
    pub async fn run_next(&self) -> Result<bool, StoreError> {
        let Some(task) = self.store.claim_next_task(Utc::now()).await? else {
            return Ok(false);
        };
        self.process(&task).await?;
        Ok(true)
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(task_id = task.id, binding_id = task.binding_id)
    )]
    async fn process(&self, task: &AsyncTask) -> Result<(), StoreError> {
        let input = match AiReplyInput::from_task(task) {
            Ok(input) => input,
            Err(e) => {
                self.store.fail_task(task.id, &e.to_string(), Utc::now()).await?;
                return Ok(());
            }
        };
        let message = match self.store.get_message_log(input.message_log_id).await {
            Ok(message) => message,
            Err(e) => {
                self.store.fail_task(task.id, &e.to_string(), Utc::now()).await?;
                return Ok(());
            }
        };
        if !self.store.mark_message_processing(message.id).await? {
            tracing::info!(
                message_log_id = message.id,
                status = %message.processing_status,
                "message already claimed; skipping task"
            );
            self.store
                .complete_task(
                    task.id,
                    &json!({ "skipped": "message already claimed" }),
                    Utc::now(),
                )
                .await?;
            return Ok(());
        }

        match self.generate_and_send(&message, &input.text).await {
            Ok(reply) => {
                let now = Utc::now();
                self.store
                    .complete_task(task.id, &json!({ "reply": reply }), now)
                    .await?;
                self.store
                    .insert_message_log(NewMessageLog::outbound(
                        message.binding_id,
                        message.platform_type,
                        &message.platform_user_id,
                        reply,
                        now,
                    ))
                    .await?;
                self.store
                    .update_message_status(message.id, ProcessingStatus::Completed, None, now)
                    .await?;
                tracing::info!(message_log_id = message.id, "ai reply delivered");
            }
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(message_log_id = message.id, error = %error, "ai reply failed");
                let now = Utc::now();
                self.store.fail_task(task.id, &error, now).await?;
                self.store
                    .update_message_status(message.id, ProcessingStatus::Failed, Some(&error), now)
                    .await?;
                self.send_failure_notice(&message).await;
            }
        }
        Ok(())
    }

    async fn generate_and_send(&self, message: &MessageLog, text: &str) -> anyhow::Result<String> {
        let adapter = self
            .adapters
            .get(message.platform_type)
            .ok_or_else(|| anyhow::anyhow!("no adapter configured for {}", message.platform_type))?;
        let reply = tokio::time::timeout(
            self.settings.ai_timeout,
            self.llm.complete(self.settings.system_prompt.as_deref(), text),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "ai completion timed out after {}s",
                self.settings.ai_timeout.as_secs()
            )
        })??;
        adapter.send(&message.platform_user_id, &reply).await?;
        Ok(reply)
    }

    async fn send_failure_notice(&self, message: &MessageLog) {
        let Some(adapter) = self.adapters.get(message.platform_type) else {
            return;
        };
        let mut outbound = NewMessageLog::outbound(
            message.binding_id,
            message.platform_type,
            &message.platform_user_id,
            FAILURE_NOTICE,
            Utc::now(),
        );
        if let Err(e) = adapter.send(&message.platform_user_id, FAILURE_NOTICE).await {
            tracing::warn!(error = %e, "failure notice could not be delivered");
            outbound.processing_status = ProcessingStatus::Failed;
            outbound.error_message = Some(e.to_string());
        }
        if let Err(e) = self.store.insert_message_log(outbound).await {
            tracing::warn!(error = %e, "failure notice could not be logged");
        }
    }
}
