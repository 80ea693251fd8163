//! Key-value backends for session state.
//!
//! One trait, two variants: a remote Redis-compatible service and an in-process
//! fallback. The variant is chosen once at startup by [`select_backend`] and
//! injected into [`crate::session::SessionStore`]; nothing re-selects later.

mod memory;
mod redis_backend;

pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Errors from a key-value backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Probe or connection failed; the backend cannot be used.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend command failed: {0}")]
    Command(#[from] redis::RedisError),
    #[error("backend value encoding: {0}")]
    Encoding(String),
}

/// Which backend variant is active for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Memory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Redis => "redis",
            BackendKind::Memory => "memory",
        }
    }
}

/// Ordered key-value and list store.
///
/// `rpush_trim` must append and trim as one logical operation so concurrent
/// appends to the same key never observe or leave a list longer than `max_len`.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), BackendError>;

    /// Append `value` to the list at `key`, keeping only the last `max_len` elements.
    async fn rpush_trim(&self, key: &str, value: &[u8], max_len: usize)
        -> Result<(), BackendError>;

    /// All elements of the list at `key`, oldest first. Empty when absent.
    async fn range(&self, key: &str) -> Result<Vec<Vec<u8>>, BackendError>;

    /// Remove `key` (value or list). Absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Keys starting with `prefix`, in no particular order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    /// Liveness check used by the health endpoint.
    async fn ping(&self) -> Result<(), BackendError>;
}

/// Pick the process-wide backend: Redis when `redis_url` is set and answers a
/// probe within `probe_timeout`, otherwise the in-memory fallback.
///
/// The probe is one-shot; a Redis server that comes up later is only picked up
/// by restarting the process.
pub async fn select_backend(
    redis_url: Option<&str>,
    probe_timeout: Duration,
) -> Arc<dyn KeyValueBackend> {
    let Some(url) = redis_url.map(str::trim).filter(|u| !u.is_empty()) else {
        log::warn!("session store: no redis url configured, using in-memory fallback (state is lost on restart)");
        return Arc::new(MemoryBackend::new());
    };
    match RedisBackend::connect(url, probe_timeout).await {
        Ok(backend) => {
            log::info!("session store: redis backend reachable");
            Arc::new(backend)
        }
        Err(e) => {
            log::warn!(
                "session store: redis probe failed ({}), using in-memory fallback (state is lost on restart)",
                e
            );
            Arc::new(MemoryBackend::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_url_selects_memory() {
        let backend = select_backend(None, Duration::from_millis(100)).await;
        assert_eq!(backend.kind(), BackendKind::Memory);
        let backend = select_backend(Some("  "), Duration::from_millis(100)).await;
        assert_eq!(backend.kind(), BackendKind::Memory);
    }

    #[tokio::test]
    async fn unreachable_redis_falls_back_to_memory() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
            listener.local_addr().expect("local_addr").port()
        };
        let url = format!("redis://127.0.0.1:{}/", port);
        let backend = select_backend(Some(&url), Duration::from_millis(300)).await;
        assert_eq!(backend.kind(), BackendKind::Memory);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn invalid_redis_url_falls_back_to_memory() {
        let backend = select_backend(Some("not a url"), Duration::from_millis(100)).await;
        assert_eq!(backend.kind(), BackendKind::Memory);
    }
}
