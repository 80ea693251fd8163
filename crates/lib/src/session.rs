//! Per-user session state: context label and bounded recent history.
//!
//! Keys: `context:{id}`, `history:{id}` (list), `last_interaction:{id}` (RFC 3339).
//! Reads never fail (backend errors read as "absent"); writes are best-effort
//! and only logged on failure, so a storage outage never blocks a reply.

use crate::classifier::ContextLabel;
use crate::store::{BackendKind, KeyValueBackend};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Default number of history entries kept per session.
pub const DEFAULT_HISTORY_LIMIT: usize = 4;

const CONTEXT_PREFIX: &str = "context:";
const HISTORY_PREFIX: &str = "history:";
const LAST_INTERACTION_PREFIX: &str = "last_interaction:";

/// Stable user/channel identifier (Telegram chat id, or any string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for SessionId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Typed session operations over the process-wide backend.
pub struct SessionStore {
    backend: Arc<dyn KeyValueBackend>,
    history_limit: usize,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>, history_limit: usize) -> Self {
        Self {
            backend,
            history_limit,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// True when the backend answers a ping.
    pub async fn backend_reachable(&self) -> bool {
        self.backend.ping().await.is_ok()
    }

    /// Stored label, or `GeneralConversation` when absent, unreadable or unknown.
    pub async fn get_context(&self, id: &SessionId) -> ContextLabel {
        let key = format!("{}{}", CONTEXT_PREFIX, id);
        match self.backend.get(&key).await {
            Ok(Some(bytes)) => String::from_utf8_lossy(&bytes)
                .parse()
                .unwrap_or_else(|e| {
                    log::debug!("session {}: {}, using default", id, e);
                    ContextLabel::default()
                }),
            Ok(None) => ContextLabel::default(),
            Err(e) => {
                log::warn!("session {}: context read failed: {}", id, e);
                ContextLabel::default()
            }
        }
    }

    pub async fn set_context(&self, id: &SessionId, label: ContextLabel) {
        let key = format!("{}{}", CONTEXT_PREFIX, id);
        if let Err(e) = self.backend.set(&key, label.as_str().as_bytes()).await {
            log::warn!("session {}: context write dropped: {}", id, e);
            return;
        }
        self.touch(id).await;
    }

    /// Append one entry and trim to the last `history_limit` in a single backend call.
    pub async fn append_history(&self, id: &SessionId, line: &str) {
        let key = format!("{}{}", HISTORY_PREFIX, id);
        if let Err(e) = self
            .backend
            .rpush_trim(&key, line.as_bytes(), self.history_limit)
            .await
        {
            log::warn!("session {}: history append dropped: {}", id, e);
            return;
        }
        self.touch(id).await;
    }

    /// History oldest-first; empty when absent or unreadable.
    pub async fn get_history(&self, id: &SessionId) -> Vec<String> {
        let key = format!("{}{}", HISTORY_PREFIX, id);
        match self.backend.range(&key).await {
            Ok(items) => items
                .into_iter()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .collect(),
            Err(e) => {
                log::warn!("session {}: history read failed: {}", id, e);
                Vec::new()
            }
        }
    }

    pub async fn last_interaction(&self, id: &SessionId) -> Option<DateTime<Utc>> {
        let key = format!("{}{}", LAST_INTERACTION_PREFIX, id);
        let bytes = self.backend.get(&key).await.ok().flatten()?;
        DateTime::parse_from_rfc3339(&String::from_utf8_lossy(&bytes))
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Remove context, history and timestamp for `id`.
    pub async fn clear(&self, id: &SessionId) {
        for prefix in [CONTEXT_PREFIX, HISTORY_PREFIX, LAST_INTERACTION_PREFIX] {
            let key = format!("{}{}", prefix, id);
            if let Err(e) = self.backend.delete(&key).await {
                log::warn!("session {}: delete of {} failed: {}", id, key, e);
            }
        }
    }

    /// Delete every session whose last interaction is older than `max_age`.
    /// Returns how many were removed. Sessions without a readable timestamp are kept.
    pub async fn sweep_idle(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let keys = match self.backend.keys_with_prefix(LAST_INTERACTION_PREFIX).await {
            Ok(k) => k,
            Err(e) => {
                log::warn!("session sweep: listing sessions failed: {}", e);
                return 0;
            }
        };
        let mut removed = 0;
        for key in keys {
            let Some(raw_id) = key.strip_prefix(LAST_INTERACTION_PREFIX) else {
                continue;
            };
            let id = SessionId::new(raw_id);
            match self.last_interaction(&id).await {
                Some(at) if at < cutoff => {
                    self.clear(&id).await;
                    removed += 1;
                }
                _ => {}
            }
        }
        log::info!("session sweep: removed {} idle session(s)", removed);
        removed
    }

    async fn touch(&self, id: &SessionId) {
        self.touch_at(id, Utc::now()).await;
    }

    async fn touch_at(&self, id: &SessionId, at: DateTime<Utc>) {
        let key = format!("{}{}", LAST_INTERACTION_PREFIX, id);
        if let Err(e) = self.backend.set(&key, at.to_rfc3339().as_bytes()).await {
            log::debug!("session {}: last_interaction write dropped: {}", id, e);
        }
    }
}
