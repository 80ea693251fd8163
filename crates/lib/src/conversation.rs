//! The dispatched task body: classify, update the session, ask the model, reply.

use crate::channels::Responder;
use crate::classifier::{self, ContextLabel};
use crate::dispatch::{EventKind, InboundEvent, TaskHandler};
use crate::llm::Completer;
use crate::prompt;
use crate::session::{SessionId, SessionStore};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;

/// Sent when the model call fails for any reason.
pub const FALLBACK_REPLY: &str =
    "Sorry, I'm having a little trouble answering right now. Please try again in a moment.";
/// Sent for voice notes; transcription is not available.
pub const VOICE_FALLBACK_REPLY: &str =
    "Sorry, I couldn't catch that voice message. Could you type it for me instead?";
pub const GREETING_REPLY: &str =
    "Hello! I'm your companion. Tell me about your day, or ask me anything.";
pub const RESET_REPLY: &str = "All right, let's start fresh. What would you like to talk about?";
pub const HELP_REPLY: &str = "You can just write to me. Use /reset to start a fresh conversation.";

/// Handles every event kind the Telegram channel produces.
pub struct Conversation {
    sessions: Arc<SessionStore>,
    llm: Arc<dyn Completer>,
    responder: Arc<dyn Responder>,
}

impl Conversation {
    pub fn new(
        sessions: Arc<SessionStore>,
        llm: Arc<dyn Completer>,
        responder: Arc<dyn Responder>,
    ) -> Self {
        Self {
            sessions,
            llm,
            responder,
        }
    }

    /// Current label for `session`.
    pub async fn context_of(&self, session: &SessionId) -> ContextLabel {
        self.sessions.get_context(session).await
    }

    async fn reply(&self, session: &SessionId, text: &str) -> anyhow::Result<()> {
        self.responder
            .respond(session, text)
            .await
            .with_context(|| format!("sending reply to session {}", session))
    }

    async fn on_text(&self, session: &SessionId, text: &str) -> anyhow::Result<()> {
        let previous = self.sessions.get_context(session).await;
        let label = classifier::classify(text);
        if label != previous {
            log::debug!("session {}: context {} -> {}", session, previous, label);
        }
        self.sessions.set_context(session, label).await;

        let history = self.sessions.get_history(session).await;
        let prompt = prompt::format_prompt(label, &history, text, self.sessions.history_limit());
        let reply = match self.llm.complete(&prompt).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("session {}: model call failed: {}", session, e);
                FALLBACK_REPLY.to_string()
            }
        };
        self.reply(session, &reply).await?;
        self.sessions
            .append_history(session, &history_entry(text, &reply))
            .await;
        Ok(())
    }

    async fn on_command(&self, session: &SessionId, name: &str) -> anyhow::Result<()> {
        match name {
            "start" => self.reply(session, GREETING_REPLY).await,
            "reset" => {
                self.sessions.clear(session).await;
                self.reply(session, RESET_REPLY).await
            }
            _ => self.reply(session, HELP_REPLY).await,
        }
    }
}

/// One history entry per exchange.
pub fn history_entry(user: &str, reply: &str) -> String {
    format!("User: {}\nCompanion: {}", user.trim(), reply.trim())
}

#[async_trait]
impl TaskHandler for Conversation {
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()> {
        let session = &event.session_id;
        match &event.kind {
            EventKind::Text(text) => self.on_text(session, text).await,
            EventKind::Command { name, .. } => self.on_command(session, name).await,
            EventKind::Voice { .. } => self.reply(session, VOICE_FALLBACK_REPLY).await,
            EventKind::PollAnswer {
                poll_id,
                option_ids,
            } => {
                let options: Vec<String> = option_ids.iter().map(u32::to_string).collect();
                self.sessions
                    .append_history(
                        session,
                        &format!("User answered poll {} with option(s) {}", poll_id, options.join(",")),
                    )
                    .await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::store::MemoryBackend;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(SessionId, String)>>,
    }

    #[async_trait]
    impl Responder for Outbox {
        async fn respond(&self, session: &SessionId, text: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((session.clone(), text.to_string()));
            Ok(())
        }
    }

    struct Echo;

    #[async_trait]
    impl Completer for Echo {
        async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
            Ok(format!("echo {}", prompt.len()))
        }
    }

    struct Broken;

    #[async_trait]
    impl Completer for Broken {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            Err(LlmError::Transport("connection refused".to_string()))
        }
    }

    fn setup(llm: Arc<dyn Completer>) -> (Conversation, Arc<SessionStore>, Arc<Outbox>) {
        let sessions = Arc::new(SessionStore::new(Arc::new(MemoryBackend::new()), 4));
        let outbox = Arc::new(Outbox::default());
        (
            Conversation::new(sessions.clone(), llm, outbox.clone()),
            sessions,
            outbox,
        )
    }

    #[tokio::test]
    async fn text_updates_context_history_and_replies() {
        let (conv, sessions, outbox) = setup(Arc::new(Echo));
        conv.handle(&InboundEvent::text(42, "I have a headache")).await.unwrap();
        let id = SessionId::from(42);
        assert_eq!(sessions.get_context(&id).await, ContextLabel::HealthWellness);
        assert_eq!(conv.context_of(&id).await, ContextLabel::HealthWellness);
        let history = sessions.get_history(&id).await;
        assert_eq!(history.len(), 1);
        assert!(history[0].starts_with("User: I have a headache\nCompanion: echo "));
        assert_eq!(outbox.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn model_failure_sends_fallback() {
        let (conv, sessions, outbox) = setup(Arc::new(Broken));
        conv.handle(&InboundEvent::text(1, "hello")).await.unwrap();
        assert_eq!(outbox.sent.lock().unwrap()[0].1, FALLBACK_REPLY);
        assert_eq!(
            sessions.get_history(&SessionId::from(1)).await,
            vec![history_entry("hello", FALLBACK_REPLY)]
        );
    }

    #[tokio::test]
    async fn reset_command_clears_session() {
        let (conv, sessions, outbox) = setup(Arc::new(Echo));
        conv.handle(&InboundEvent::text(5, "I feel lonely")).await.unwrap();
        conv.handle(&InboundEvent::new(
            5,
            EventKind::Command {
                name: "reset".to_string(),
                args: String::new(),
            },
        ))
        .await
        .unwrap();
        let id = SessionId::from(5);
        assert_eq!(sessions.get_context(&id).await, ContextLabel::GeneralConversation);
        assert!(sessions.get_history(&id).await.is_empty());
        assert_eq!(outbox.sent.lock().unwrap().last().unwrap().1, RESET_REPLY);
    }

    #[tokio::test]
    async fn voice_gets_fallback_and_poll_is_recorded() {
        let (conv, sessions, outbox) = setup(Arc::new(Echo));
        conv.handle(&InboundEvent::new(
            9,
            EventKind::Voice {
                file_id: "f".to_string(),
                duration_secs: 2,
            },
        ))
        .await
        .unwrap();
        conv.handle(&InboundEvent::new(
            9,
            EventKind::PollAnswer {
                poll_id: "p".to_string(),
                option_ids: vec![1],
            },
        ))
        .await
        .unwrap();
        let sent = outbox.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![(SessionId::from(9), VOICE_FALLBACK_REPLY.to_string())]);
        assert_eq!(
            sessions.get_history(&SessionId::from(9)).await,
            vec!["User answered poll p with option(s) 1".to_string()]
        );
    }
}
