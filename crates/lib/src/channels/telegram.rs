//! Telegram channel: update parsing, getUpdates long-poll, webhook registration and sendMessage.

use crate::channels::Responder;
use crate::dispatch::{DispatchBridge, EventKind, InboundEvent, SubmitError};
use crate::session::SessionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("telegram bot token not configured")]
    MissingToken,
    #[error("telegram request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("telegram api error: {0}")]
    Api(String),
}

/// Rejected webhook body; answered with 400 and never dispatched.
#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("malformed inbound payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram update payload (getUpdates result item or webhook POST body).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub poll_answer: Option<TelegramPollAnswer>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub voice: Option<TelegramVoice>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramVoice {
    pub file_id: String,
    #[serde(default)]
    pub duration: u32,
}

#[derive(Debug, Deserialize)]
pub struct TelegramPollAnswer {
    pub poll_id: String,
    pub user: TelegramUser,
    #[serde(default)]
    pub option_ids: Vec<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
}

/// Parse a webhook body. Errors only on invalid JSON or a missing `update_id`.
pub fn parse_update(body: &[u8]) -> Result<TelegramUpdate, InboundError> {
    Ok(serde_json::from_slice(body)?)
}

impl TelegramUpdate {
    /// Convert to an inbound event; `None` for update types the bot ignores.
    pub fn into_event(self) -> Option<InboundEvent> {
        let update_id = self.update_id;
        let (session_id, kind, sent_at) = if let Some(msg) = self.message {
            let kind = if let Some(text) = msg.text {
                command_or_text(text)
            } else if let Some(voice) = msg.voice {
                EventKind::Voice {
                    file_id: voice.file_id,
                    duration_secs: voice.duration,
                }
            } else {
                return None;
            };
            (SessionId::from(msg.chat.id), kind, msg.date)
        } else if let Some(answer) = self.poll_answer {
            let kind = EventKind::PollAnswer {
                poll_id: answer.poll_id,
                option_ids: answer.option_ids,
            };
            (SessionId::from(answer.user.id), kind, None)
        } else {
            return None;
        };
        Some(InboundEvent {
            kind,
            session_id,
            received_at: Utc::now(),
            sent_at: sent_at.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
            delivery_id: Some(update_id),
        })
    }
}

/// `/name@bot args` becomes a command; anything else is plain text.
fn command_or_text(text: String) -> EventKind {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return EventKind::Text(text);
    };
    let (head, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let name = head.split('@').next().unwrap_or(head).to_lowercase();
    if name.is_empty() {
        return EventKind::Text(text);
    }
    EventKind::Command {
        name,
        args: args.trim().to_string(),
    }
}

/// Resolve Telegram bot API base URL (env `TELEGRAM_API_BASE` for tests or custom endpoints).
pub fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE")
        .ok()
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| TELEGRAM_API_BASE.to_string())
}

/// Telegram channel connector: long-polls for updates and sends replies via sendMessage.
pub struct TelegramChannel {
    api_base: String,
    token: Option<String>,
    running: AtomicBool,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: Option<String>) -> Self {
        Self::with_api_base(token, telegram_api_base())
    }

    pub fn with_api_base(token: Option<String>, api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            token,
            running: AtomicBool::new(false),
            client: reqwest::Client::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn method_url(&self, method: &str) -> Result<String, TelegramError> {
        let token = self.token.as_ref().ok_or(TelegramError::MissingToken)?;
        Ok(format!("{}/bot{}/{}", self.api_base, token, method))
    }

    /// Start the getUpdates long-poll loop, submitting each event to `bridge`.
    pub fn start_inbound(self: Arc<Self>, bridge: Arc<DispatchBridge>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("telegram channel: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            run_get_updates_loop(self, bridge).await;
        })
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), TelegramError> {
        let mut url = format!("{}?timeout={}", self.method_url("getUpdates")?, LONG_POLL_TIMEOUT);
        if let Some(off) = offset {
            url.push_str(&format!("&offset={}", off));
        }
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(TelegramError::Api(format!("getUpdates failed: {} {}", status, body)));
        }
        let data: GetUpdatesResponse = res.json().await?;
        if !data.ok {
            return Err(TelegramError::Api("getUpdates returned ok: false".to_string()));
        }
        let next_offset = data
            .result
            .iter()
            .map(|u| u.update_id)
            .max()
            .map(|id| id + 1);
        Ok((data.result, next_offset))
    }

    async fn post_method(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<(), TelegramError> {
        let url = self.method_url(method)?;
        let res = self.client.post(&url).json(&body).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(TelegramError::Api(format!("{} failed: {} {}", method, status, body)));
        }
        let data: ApiResponse = res.json().await?;
        if !data.ok {
            return Err(TelegramError::Api(format!(
                "{} returned ok: false ({})",
                method,
                data.description.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Set webhook URL (and optional secret). Telegram then POSTs updates there instead of getUpdates.
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), TelegramError> {
        let mut body = serde_json::json!({ "url": url });
        if let Some(s) = secret {
            body["secret_token"] = serde_json::Value::String(s.to_string());
        }
        self.post_method("setWebhook", body).await
    }

    /// Remove the webhook so getUpdates works again; optionally discard queued updates.
    pub async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<(), TelegramError> {
        self.post_method(
            "deleteWebhook",
            serde_json::json!({ "drop_pending_updates": drop_pending_updates }),
        )
        .await
    }

    /// Send a text message to a chat via sendMessage API.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), TelegramError> {
        self.post_method(
            "sendMessage",
            serde_json::json!({ "chat_id": chat_id, "text": text }),
        )
        .await
    }
}

async fn run_get_updates_loop(channel: Arc<TelegramChannel>, bridge: Arc<DispatchBridge>) {
    let mut offset: Option<i64> = None;
    while channel.running() {
        match channel.get_updates(offset).await {
            Ok((updates, next)) => {
                offset = next.or(offset);
                for update in updates {
                    let Some(event) = update.into_event() else {
                        continue;
                    };
                    match bridge.submit(event) {
                        Ok(_) => {}
                        Err(SubmitError::ShuttingDown) => {
                            log::debug!("telegram: dispatch closed, stopping loop");
                            return;
                        }
                        Err(e) => log::warn!("telegram: update dropped: {}", e),
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl Responder for TelegramChannel {
    async fn respond(&self, session: &SessionId, text: &str) -> anyhow::Result<()> {
        self.send_message(session.as_str(), text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_becomes_text_event() {
        let body = br#"{"update_id":10,"message":{"message_id":1,"date":1700000000,"chat":{"id":42},"text":"I have a headache"}}"#;
        let event = parse_update(body).unwrap().into_event().unwrap();
        assert_eq!(event.session_id, SessionId::from(42));
        assert_eq!(event.kind, EventKind::Text("I have a headache".to_string()));
        assert_eq!(event.delivery_id, Some(10));
        assert_eq!(event.sent_at.map(|t| t.timestamp()), Some(1_700_000_000));
        assert!(event.received_at > event.sent_at.unwrap());
    }

    #[test]
    fn slash_text_becomes_command() {
        let body = br#"{"update_id":11,"message":{"chat":{"id":-5},"text":"/Start@companion_bot hello there"}}"#;
        let event = parse_update(body).unwrap().into_event().unwrap();
        assert_eq!(
            event.kind,
            EventKind::Command {
                name: "start".to_string(),
                args: "hello there".to_string()
            }
        );
        assert_eq!(command_or_text("/".to_string()), EventKind::Text("/".to_string()));
    }

    #[test]
    fn voice_and_poll_answer() {
        let voice = br#"{"update_id":12,"message":{"chat":{"id":7},"voice":{"file_id":"abc","duration":3}}}"#;
        let event = parse_update(voice).unwrap().into_event().unwrap();
        assert_eq!(
            event.kind,
            EventKind::Voice {
                file_id: "abc".to_string(),
                duration_secs: 3
            }
        );

        let poll = br#"{"update_id":13,"poll_answer":{"poll_id":"p1","user":{"id":99},"option_ids":[0,2]}}"#;
        let event = parse_update(poll).unwrap().into_event().unwrap();
        assert_eq!(event.session_id, SessionId::from(99));
        assert_eq!(
            event.kind,
            EventKind::PollAnswer {
                poll_id: "p1".to_string(),
                option_ids: vec![0, 2]
            }
        );
    }

    #[test]
    fn unsupported_updates_are_ignored() {
        let sticker = br#"{"update_id":14,"message":{"chat":{"id":7},"sticker":{}}}"#;
        assert!(parse_update(sticker).unwrap().into_event().is_none());
        let edited = br#"{"update_id":15,"edited_message":{"chat":{"id":7},"text":"x"}}"#;
        assert!(parse_update(edited).unwrap().into_event().is_none());
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(parse_update(b"not json").is_err());
        assert!(parse_update(br#"{"message":{}}"#).is_err());
    }

    #[tokio::test]
    async fn missing_token_is_reported() {
        let channel = TelegramChannel::with_api_base(None, "http://127.0.0.1:9");
        assert!(matches!(
            channel.send_message("1", "hi").await,
            Err(TelegramError::MissingToken)
        ));
    }
}
