//! End-to-end: events submitted to the bridge run the conversation task body
//! against a fake model and a recording responder.

use async_trait::async_trait;
use lib::channels::Responder;
use lib::classifier::ContextLabel;
use lib::conversation::{history_entry, Conversation};
use lib::dispatch::{DispatchBridge, DispatchOptions, EventKind, InboundEvent, TaskHandler};
use lib::llm::{Completer, LlmError};
use lib::session::{SessionId, SessionStore};
use lib::store::{select_backend, BackendKind, MemoryBackend};
use std::sync::{Arc, Mutex};
use std::time::Duration;

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

/// Replies with the last line of the user's message.
struct Parrot;

#[async_trait]
impl Completer for Parrot {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let query = prompt
            .lines()
            .filter_map(|l| l.strip_prefix("User: "))
            .last()
            .unwrap_or_default();
        Ok(format!("you said {}", query))
    }
}

/// Fails on "boom", otherwise hands the event to the conversation.
struct Flaky {
    inner: Conversation,
}

#[async_trait]
impl TaskHandler for Flaky {
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()> {
        if event.kind == EventKind::Text("boom".to_string()) {
            anyhow::bail!("simulated failure");
        }
        self.inner.handle(event).await
    }
}

fn conversation(sessions: Arc<SessionStore>, outbox: Arc<Outbox>) -> Conversation {
    Conversation::new(sessions, Arc::new(Parrot), outbox)
}

fn options() -> DispatchOptions {
    DispatchOptions {
        task_timeout: Duration::from_secs(5),
        ..DispatchOptions::default()
    }
}

#[tokio::test]
async fn headache_sets_health_context() {
    let sessions = Arc::new(SessionStore::new(Arc::new(MemoryBackend::new()), 4));
    let outbox = Arc::new(Outbox::default());
    let bridge = DispatchBridge::start(
        Arc::new(conversation(sessions.clone(), outbox.clone())),
        options(),
    );
    bridge.submit(InboundEvent::text(42, "I have a headache")).unwrap();
    assert!(bridge.shutdown(Duration::from_secs(5)).await);

    let id = SessionId::from(42);
    assert_eq!(sessions.get_context(&id).await, ContextLabel::HealthWellness);
    let sent = outbox.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![(id, "you said I have a headache".to_string())]);
}

#[tokio::test]
async fn history_keeps_the_last_four_exchanges() {
    let sessions = Arc::new(SessionStore::new(Arc::new(MemoryBackend::new()), 4));
    let outbox = Arc::new(Outbox::default());
    let bridge = DispatchBridge::start(
        Arc::new(conversation(sessions.clone(), outbox.clone())),
        options(),
    );
    for i in 1..=5 {
        bridge
            .submit(InboundEvent::text(7, format!("message {}", i)))
            .unwrap();
    }
    assert!(bridge.shutdown(Duration::from_secs(5)).await);

    let history = sessions.get_history(&SessionId::from(7)).await;
    let expected: Vec<String> = (2..=5)
        .map(|i| history_entry(&format!("message {}", i), &format!("you said message {}", i)))
        .collect();
    assert_eq!(history, expected);
}

#[tokio::test]
async fn failing_task_does_not_stop_later_events() {
    let sessions = Arc::new(SessionStore::new(Arc::new(MemoryBackend::new()), 4));
    let outbox = Arc::new(Outbox::default());
    let handler = Flaky {
        inner: conversation(sessions.clone(), outbox.clone()),
    };
    let bridge = DispatchBridge::start(Arc::new(handler), options());
    bridge.submit(InboundEvent::text(3, "I feel lonely")).unwrap();
    bridge.submit(InboundEvent::text(3, "boom")).unwrap();
    bridge.submit(InboundEvent::text(3, "my phone is broken")).unwrap();
    assert!(bridge.shutdown(Duration::from_secs(5)).await);

    let stats = bridge.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 1);
    let id = SessionId::from(3);
    assert_eq!(sessions.get_history(&id).await.len(), 2);
    assert_eq!(sessions.get_context(&id).await, ContextLabel::TechnologyHelp);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_redis_falls_back_and_behaves_the_same() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let url = format!("redis://127.0.0.1:{}", port);
    let backend = select_backend(Some(&url), Duration::from_millis(300)).await;
    assert_eq!(backend.kind(), BackendKind::Memory);

    let sessions = Arc::new(SessionStore::new(backend, 4));
    let outbox = Arc::new(Outbox::default());
    let bridge = DispatchBridge::start(
        Arc::new(conversation(sessions.clone(), outbox.clone())),
        options(),
    );
    bridge.submit(InboundEvent::text(42, "I have a headache")).unwrap();
    bridge.submit(InboundEvent::text(43, "hello there")).unwrap();
    assert!(bridge.shutdown(Duration::from_secs(5)).await);

    assert_eq!(
        sessions.get_context(&SessionId::from(42)).await,
        ContextLabel::HealthWellness
    );
    assert_eq!(
        sessions.get_context(&SessionId::from(43)).await,
        ContextLabel::GeneralConversation
    );
    assert_eq!(outbox.sent.lock().unwrap().len(), 2);

    let fresh = SessionId::from(9999);
    assert_eq!(sessions.get_context(&fresh).await, ContextLabel::GeneralConversation);
    assert!(sessions.get_history(&fresh).await.is_empty());

    let id = SessionId::from(8);
    for i in 0..7 {
        sessions.append_history(&id, &format!("line {}", i)).await;
    }
    let expected: Vec<String> = (3..7).map(|i| format!("line {}", i)).collect();
    assert_eq!(sessions.get_history(&id).await, expected);

    let shared = SessionId::from(77);
    let mut handles = Vec::new();
    for t in 0..8 {
        let sessions = sessions.clone();
        let shared = shared.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                sessions.append_history(&shared, &format!("{}-{}", t, i)).await;
                assert!(sessions.get_history(&shared).await.len() <= 4);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(sessions.get_history(&shared).await.len(), 4);
}
