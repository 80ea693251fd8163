//! Redis/Valkey backend over a multiplexed async connection.

use super::{BackendError, BackendKind, KeyValueBackend};
use async_trait::async_trait;
use redis::FromRedisValue;
use std::time::Duration;
use tokio::sync::Mutex;

/// Per-command ceiling so a stalled server cannot hold a task past its own timeout.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RedisBackend {
    client: redis::Client,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisBackend {
    /// Open a client for `url` and run one PING within `probe_timeout`.
    /// Returns `Unavailable`/`Timeout` instead of a backend that would fail later.
    pub async fn connect(url: &str, probe_timeout: Duration) -> Result<Self, BackendError> {
        let client = redis::Client::open(url)
            .map_err(|e| BackendError::Unavailable(format!("invalid redis url: {}", e)))?;
        let probe = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(conn)
        };
        let conn = match tokio::time::timeout(probe_timeout, probe).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(BackendError::Unavailable(e.to_string())),
            Err(_) => return Err(BackendError::Timeout(probe_timeout)),
        };
        Ok(Self {
            client,
            connection: Mutex::new(Some(conn)),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BackendError> {
        let mut g = self.connection.lock().await;
        if let Some(conn) = g.as_ref() {
            return Ok(conn.clone());
        }
        let conn = tokio::time::timeout(
            COMMAND_TIMEOUT,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| BackendError::Timeout(COMMAND_TIMEOUT))??;
        log::debug!("redis backend: reconnected");
        *g = Some(conn.clone());
        Ok(conn)
    }

    /// Forget the cached connection so the next call reconnects.
    async fn reset(&self) {
        *self.connection.lock().await = None;
    }

    async fn run_command<T: FromRedisValue>(
        &self,
        operation: &'static str,
        cmd: redis::Cmd,
    ) -> Result<T, BackendError> {
        let mut conn = self.connection().await?;
        let result: Result<redis::RedisResult<T>, _> =
            tokio::time::timeout(COMMAND_TIMEOUT, cmd.query_async(&mut conn)).await;
        match result {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => {
                log::debug!("redis backend: {} failed: {}", operation, e);
                self.reset().await;
                Err(e.into())
            }
            Err(_) => {
                self.reset().await;
                Err(BackendError::Timeout(COMMAND_TIMEOUT))
            }
        }
    }
}

#[async_trait]
impl KeyValueBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run_command("get", cmd).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        self.run_command("set", cmd).await
    }

    async fn rpush_trim(
        &self,
        key: &str,
        value: &[u8],
        max_len: usize,
    ) -> Result<(), BackendError> {
        if max_len == 0 {
            return self.delete(key).await;
        }
        let start = -i64::try_from(max_len)
            .map_err(|_| BackendError::Encoding(format!("history bound too large: {}", max_len)))?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("RPUSH").arg(key).arg(value).ignore();
        pipe.cmd("LTRIM").arg(key).arg(start).arg(-1).ignore();
        let mut conn = self.connection().await?;
        let result: Result<redis::RedisResult<()>, _> =
            tokio::time::timeout(COMMAND_TIMEOUT, pipe.query_async(&mut conn)).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                log::debug!("redis backend: rpush_trim failed: {}", e);
                self.reset().await;
                Err(e.into())
            }
            Err(_) => {
                self.reset().await;
                Err(BackendError::Timeout(COMMAND_TIMEOUT))
            }
        }
    }

    async fn range(&self, key: &str) -> Result<Vec<Vec<u8>>, BackendError> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(0).arg(-1);
        self.run_command("range", cmd).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _: i64 = self.run_command("delete", cmd).await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let pattern = format!("{}*", prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg(&pattern).arg("COUNT").arg(200);
            let (next, batch): (u64, Vec<String>) = self.run_command("scan", cmd).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let _: String = self.run_command("ping", redis::cmd("PING")).await?;
        Ok(())
    }
}
