//! Bridge server: wires the store, adapters, router and worker pool behind the axum app.

use crate::binding::BindingManager;
use crate::config::{AiDispatch, BridgeConfig};
use crate::http_auth::AdminAuthPolicy;
use crate::platforms;
use crate::router::{MessageRouter, RouterSettings};
use crate::routes;
use crate::session::ChatSessions;
use crate::worker::{TaskQueue, WorkerPool, WorkerSettings};
use anyhow::Result;
use axum::Router;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use bridge_channels::{AdapterRegistry, FileStorage, PlatformAdapter, PlatformType};
use bridge_llm::{ChatCompletionClient, ChatCompletionConfig};
use bridge_store::{NewMessageLog, ProcessingStatus, Store};
use chrono::Utc;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub store: Store,
    pub adapters: AdapterRegistry,
    pub bindings: BindingManager,
    pub router: MessageRouter,
    pub queue: TaskQueue,
    pub llm: ChatCompletionClient,
    pub sessions: ChatSessions,
    pub system_prompt: String,
    pub dispatch: AiDispatch,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        cfg: &BridgeConfig,
        store: Store,
        adapters: AdapterRegistry,
        storage: FileStorage,
    ) -> Result<Self> {
        let bindings = BindingManager::new(
            store.clone(),
            chrono::Duration::minutes(cfg.binding.code_ttl_minutes),
        );
        let queue = TaskQueue::new(store.clone());
        let router = MessageRouter::new(
            store.clone(),
            bindings.clone(),
            adapters.clone(),
            storage,
            queue.clone(),
            RouterSettings {
                rate_limit_max_messages: cfg.router.rate_limit_max_messages,
                rate_limit_window: chrono::Duration::seconds(cfg.router.rate_limit_window_seconds),
                dispatch: cfg.ai.dispatch,
            },
        );
        let llm = ChatCompletionClient::new(ChatCompletionConfig {
            base_url: cfg.ai.base_url.clone(),
            api_key: cfg.ai.api_key.clone(),
            model: cfg.ai.model.clone(),
            timeout: Duration::from_secs(cfg.ai.timeout_seconds),
        })?;
        Ok(Self {
            store,
            adapters,
            bindings,
            router,
            queue,
            llm,
            sessions: ChatSessions::new(),
            system_prompt: cfg.ai.system_prompt.clone(),
            dispatch: cfg.ai.dispatch,
            started_at: Instant::now(),
        })
    }

    pub fn worker_pool(&self, cfg: &BridgeConfig) -> WorkerPool {
        WorkerPool::new(
            self.queue.clone(),
            self.adapters.clone(),
            self.llm.clone(),
            WorkerSettings {
                concurrency: cfg.worker.concurrency,
                poll_interval: Duration::from_millis(cfg.worker.poll_interval_ms),
                system_prompt: Some(self.system_prompt.clone()),
                ai_timeout: Duration::from_secs(cfg.ai.timeout_seconds),
            },
        )
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = BridgeConfig::load_with_path(config_path).await?;
    let db_path = cfg.database_path()?;
    let store = Store::open(&db_path).await?;
    let schema_version = store.schema_version().await?;
    let platforms = store.list_platform_configs().await?;
    tracing::info!(
        config_path = %path.display(),
        database_path = %db_path.display(),
        schema_version,
        bind_addr = %cfg.server.bind_addr,
        model = %cfg.ai.model,
        dispatch = ?cfg.ai.dispatch,
        telegram_enabled = cfg.telegram.enabled,
        wechat_enabled = cfg.wechat.enabled,
        stored_platforms = platforms.len(),
        "config ok"
    );
    println!("erp-bridge doctor: ok");
    println!("config: {}", path.display());
    println!("database: {} (schema v{schema_version})", db_path.display());
    for platform in platforms {
        println!(
            "platform {}: enabled={} webhook_url={}",
            platform.platform_type,
            platform.is_enabled,
            platform.webhook_url.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn purge_expired(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, _) = BridgeConfig::load_with_path(config_path).await?;
    let store = Store::open(cfg.database_path()?).await?;
    let manager = BindingManager::new(
        store,
        chrono::Duration::minutes(cfg.binding.code_ttl_minutes),
    );
    let purged = manager.purge_expired(Utc::now()).await?;
    println!("purged {purged} expired bind code(s)");
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    platform: &str,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let platform: PlatformType = platform.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let (cfg, _) = BridgeConfig::load_with_path(config_path).await?;
    let store = Store::open(cfg.database_path()?).await?;
    platforms::seed_platform_configs(&store, &cfg).await?;
    let config = store
        .get_platform_config(platform)
        .await?
        .filter(|config| config.is_enabled)
        .ok_or_else(|| anyhow::anyhow!("{platform} is not configured or not enabled"))?;
    let adapter: Arc<dyn PlatformAdapter> = match platform {
        PlatformType::Telegram => Arc::new(platforms::build_telegram(&config)?),
        PlatformType::Wechat => Arc::new(platforms::build_wechat(&config)?),
    };

    let binding_id = store
        .find_active_binding(platform, recipient)
        .await?
        .map(|binding| binding.id);
    let mut outbound =
        NewMessageLog::outbound(binding_id, platform, recipient, message, Utc::now());
    let sent = adapter.send(recipient, message).await;
    if let Err(e) = &sent {
        outbound.processing_status = ProcessingStatus::Failed;
        outbound.error_message = Some(e.to_string());
    }
    store.insert_message_log(outbound).await?;
    sent?;
    println!("sent to {recipient} via {platform}");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = BridgeConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    let db_path = cfg.database_path()?;
    let storage_root = cfg.storage_root()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        database_path = %db_path.display(),
        storage_root = %storage_root.display(),
        model = %cfg.ai.model,
        dispatch = ?cfg.ai.dispatch,
        worker_concurrency = cfg.worker.concurrency,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        telegram_enabled = cfg.telegram.enabled,
        wechat_enabled = cfg.wechat.enabled,
        admin_keys_configured = !cfg.security.admin_api_keys.is_empty(),
        allow_insecure_admin = cfg.security.allow_insecure_admin,
        "erp-bridge starting"
    );

    let listener = preflight_bind_listener(addr).await?;

    let store = Store::open(&db_path).await?;
    platforms::seed_platform_configs(&store, &cfg).await?;
    let adapters = AdapterRegistry::new();
    platforms::load_adapters(&store, &adapters).await?;

    let state = Arc::new(AppState::new(
        &cfg,
        store,
        adapters,
        FileStorage::new(storage_root),
    )?);

    let shutdown = CancellationToken::new();
    let mut background = vec![state.bindings.spawn_purge_task(
        Duration::from_secs(cfg.binding.purge_interval_seconds),
        shutdown.child_token(),
    )];
    let pool = state.worker_pool(&cfg);
    pool.fail_interrupted().await?;
    if cfg.ai.dispatch == AiDispatch::Worker {
        background.extend(pool.spawn(shutdown.child_token()));
        tracing::info!(workers = cfg.worker.concurrency, "worker pool started");
    } else {
        tracing::info!("polling dispatch; worker pool not started");
    }

    let app = build_app(state, &cfg);

    tracing::info!(%addr, "erp-bridge serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "background task join failed during shutdown");
        }
    }
    tracing::info!("background tasks stopped");
    Ok(())
}

pub fn build_app(state: Arc<AppState>, cfg: &BridgeConfig) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router(state, AdminAuthPolicy::from_config(cfg))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to install SIGTERM handler; falling back to ctrl_c only"
                );
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
