//! Gateway HTTP server (single port).

use crate::channels::{parse_update, TelegramChannel};
use crate::config::{self, Config};
use crate::conversation::Conversation;
use crate::dispatch::DispatchBridge;
use crate::llm::ChatCompletionsClient;
use crate::session::SessionStore;
use crate::store::select_backend;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

const SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub bridge: Arc<DispatchBridge>,
    webhook_secret: Option<String>,
}

impl GatewayState {
    pub fn new(config: Config, sessions: Arc<SessionStore>, bridge: Arc<DispatchBridge>) -> Self {
        let webhook_secret = config::resolve_webhook_secret(&config);
        Self {
            config: Arc::new(config),
            sessions,
            bridge,
            webhook_secret,
        }
    }
}

/// Routes: `GET /`, `GET /healthz`, `POST /telegram`.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(runtime_http))
        .route("/healthz", get(health_http))
        .route("/telegram", post(telegram_webhook))
        .with_state(state)
}

pub async fn run_gateway(config: Config) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    let webhook_secret = config::resolve_webhook_secret(&config);
    if !config::is_loopback_bind(&bind) && webhook_secret.is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without a webhook secret (set channels.telegram.webhookSecret)",
            bind
        );
    }

    let redis_url = config::resolve_redis_url(&config);
    let backend = select_backend(redis_url.as_deref(), config.session.probe_timeout()).await;
    let sessions = Arc::new(SessionStore::new(backend, config.session.history_limit));

    let llm = Arc::new(ChatCompletionsClient::new(
        config.llm.base_url.clone(),
        config.llm.model.clone(),
        config::resolve_llm_api_key(&config),
    ));
    log::info!("llm model: {}", llm.model());

    let telegram_token = config::resolve_telegram_token(&config);
    if telegram_token.is_none() {
        log::warn!("no telegram token configured (TELEGRAM_BOT_TOKEN); replies cannot be delivered");
    }
    let telegram = Arc::new(TelegramChannel::new(telegram_token.clone()));

    let conversation = Arc::new(Conversation::new(sessions.clone(), llm, telegram.clone()));
    let bridge = Arc::new(DispatchBridge::start(conversation, config.dispatch.options()));

    let webhook_url = config::resolve_webhook_url(&config);
    let mut poll_task = None;
    if telegram_token.is_some() {
        if let Some(ref url) = webhook_url {
            let endpoint = format!("{}/telegram", url);
            match telegram.set_webhook(&endpoint, webhook_secret.as_deref()).await {
                Ok(()) => log::info!("telegram channel registered (webhook mode): {}", endpoint),
                Err(e) => log::warn!("telegram set_webhook failed: {}", e),
            }
        } else {
            poll_task = Some(telegram.clone().start_inbound(bridge.clone()));
            log::info!("telegram channel registered and getUpdates loop started");
        }
    }

    let shutdown_timeout = config.dispatch.shutdown_timeout();
    let port = config.gateway.port;
    let app = build_router(GatewayState::new(config, sessions, bridge.clone()));

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;

    telegram.stop();
    if let Some(handle) = poll_task {
        // getUpdates may be parked in a long poll.
        handle.abort();
    }
    if telegram_token.is_some() && webhook_url.is_some() {
        if let Err(e) = telegram.delete_webhook(false).await {
            log::debug!("telegram delete_webhook on shutdown: {}", e);
        }
    }
    if !bridge.shutdown(shutdown_timeout).await {
        log::warn!("dispatch did not drain within {:?}; remaining tasks were aborted", shutdown_timeout);
    }
    log::info!("gateway stopped");
    Ok(())
}

/// Re-register the Telegram webhook at `{url}/telegram`, dropping updates queued for the old one.
/// Returns the registered endpoint.
pub async fn set_webhook(config: &Config, url: Option<String>) -> Result<String> {
    let token = config::resolve_telegram_token(config)
        .context("no telegram token configured (set TELEGRAM_BOT_TOKEN or channels.telegram.botToken)")?;
    let url = url
        .map(|u| u.trim().trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty())
        .or_else(|| config::resolve_webhook_url(config))
        .context("no webhook url configured (set WEBHOOK_URL or channels.telegram.webhookUrl)")?;
    let telegram = TelegramChannel::new(Some(token));
    telegram
        .delete_webhook(true)
        .await
        .context("deleting previous webhook")?;
    let endpoint = format!("{}/telegram", url);
    telegram
        .set_webhook(&endpoint, config::resolve_webhook_secret(config).as_deref())
        .await
        .context("registering webhook")?;
    Ok(endpoint)
}

/// Delete sessions idle for more than `days`. Returns how many were removed.
pub async fn sweep_sessions(config: &Config, days: u32) -> Result<usize> {
    let redis_url = config::resolve_redis_url(config);
    if redis_url.is_none() {
        log::warn!("no redis url configured; a fresh in-memory store has nothing to sweep");
    }
    let backend = select_backend(redis_url.as_deref(), config.session.probe_timeout()).await;
    let sessions = SessionStore::new(backend, config.session.history_limit);
    Ok(sessions.sweep_idle(chrono::Duration::days(i64::from(days))).await)
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}

/// POST /telegram: verifies the optional secret, parses the update and submits it.
/// Never waits for the task itself.
async fn telegram_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(ref expected) = state.webhook_secret {
        let provided = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected.as_str() {
            return StatusCode::FORBIDDEN;
        }
    }
    let update = match parse_update(&body) {
        Ok(u) => u,
        Err(e) => {
            log::debug!("telegram webhook: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    let update_id = update.update_id;
    let Some(event) = update.into_event() else {
        log::debug!("telegram webhook: update {} has nothing to dispatch", update_id);
        return StatusCode::OK;
    };
    match state.bridge.submit(event) {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            log::warn!("telegram webhook: update {} not accepted: {}", update_id, e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /healthz: 200 when the session backend answers and dispatch accepts work, 500 otherwise.
async fn health_http(State(state): State<GatewayState>) -> (StatusCode, Json<serde_json::Value>) {
    let reachable = state.sessions.backend_reachable().await;
    let accepting = state.bridge.is_accepting();
    let ok = reachable && accepting;
    let code = if ok {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        code,
        Json(json!({
            "status": if ok { "ok" } else { "error" },
            "backend": state.sessions.backend_kind().as_str(),
            "dispatch": state.bridge.stats(),
        })),
    )
}

/// GET / returns a simple runtime JSON.
async fn runtime_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
        "backend": state.sessions.backend_kind().as_str(),
    }))
}
