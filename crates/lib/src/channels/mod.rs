//! Communication channels (Telegram).
//!
//! Inbound updates are parsed into [`crate::dispatch::InboundEvent`]s and handed to
//! the dispatch bridge; replies go back out through a [`Responder`].

mod telegram;

pub use telegram::{
    parse_update, telegram_api_base, InboundError, TelegramChannel, TelegramError, TelegramUpdate,
};

use crate::session::SessionId;
use async_trait::async_trait;

/// Sends a reply to the conversation a session belongs to.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, session: &SessionId, text: &str) -> anyhow::Result<()>;
}
