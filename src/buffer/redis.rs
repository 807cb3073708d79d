//! Redis-backed durable buffer
//!
//! Lists are Redis lists: `RPUSH` to append, `BLPOP` to take the head.
//! Every task gets its own [`ConnectionManager`] so a worker parked in
//! `BLPOP` never stalls another task's commands. The manager reconnects
//! after the server drops it; the command that saw the drop still fails.

use super::{BufferConnection, DurableBuffer};
use crate::error::{AuditError, Result};
use async_trait::async_trait;
use ::redis::aio::{ConnectionManager, ConnectionManagerConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisBufferConfig {
    pub host: String,
    pub port: u16,

    /// Database index
    pub db: i64,

    /// Maximum connections handed out at once
    pub max_active: usize,

    /// Prefix for the worklist keys
    pub key_prefix: String,

    /// Upper bound on a single blocking pop, and so on shutdown latency
    pub pop_timeout_secs: u64,
}

impl Default for RedisBufferConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            max_active: 64,
            key_prefix: "audit".to_string(),
            pop_timeout_secs: 5,
        }
    }
}

impl RedisBufferConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs.max(1))
    }

    /// How long a reply may take; leaves room for a full `BLPOP`
    pub fn response_timeout(&self) -> Duration {
        self.pop_timeout() + Duration::from_secs(5)
    }

    fn manager_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_number_of_retries(3)
            .set_connection_timeout(Duration::from_secs(5))
            .set_response_timeout(self.response_timeout())
    }
}

/// Redis buffer backend
pub struct RedisBuffer {
    client: ::redis::Client,
    config: RedisBufferConfig,
    permits: Arc<Semaphore>,
}

impl RedisBuffer {
    /// Open the client and check the server answers
    pub async fn connect(config: &RedisBufferConfig) -> Result<Self> {
        let url = config.url();
        let client = ::redis::Client::open(url.as_str())
            .map_err(|e| AuditError::Connection(format!("{}: {}", url, e)))?;

        let mut conn = client
            .get_connection_manager_with_config(config.manager_config())
            .await
            .map_err(|e| AuditError::Connection(format!("{}: {}", url, e)))?;
        let pong: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| AuditError::Connection(format!("{}: PING failed: {}", url, e)))?;

        tracing::info!(url = %url, reply = %pong, "Connected to Redis");

        Ok(Self {
            client,
            config: config.clone(),
            permits: Arc::new(Semaphore::new(config.max_active)),
        })
    }
}

#[async_trait]
impl DurableBuffer for RedisBuffer {
    async fn connection(&self) -> Result<Box<dyn BufferConnection>> {
        let permit = self.permits.clone().try_acquire_owned().map_err(|_| {
            AuditError::Buffer(format!(
                "connection limit reached ({} active)",
                self.config.max_active
            ))
        })?;

        let conn = self
            .client
            .get_connection_manager_with_config(self.config.manager_config())
            .await?;

        Ok(Box::new(RedisBufferConnection {
            conn,
            _permit: permit,
        }))
    }

    fn name(&self) -> &str {
        "redis"
    }
}

/// One task's Redis connection; releases its slot on drop
pub struct RedisBufferConnection {
    conn: ConnectionManager,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl BufferConnection for RedisBufferConnection {
    async fn push(&mut self, key: &str, value: &str) -> Result<()> {
        let _len: i64 = ::redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn blocking_pop(&mut self, key: &str, timeout: Duration) -> Result<Option<String>> {
        // BLPOP replies [key, value], or nil on timeout
        let reply: Option<(String, String)> = ::redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut self.conn)
            .await?;
        Ok(reply.map(|(_, value)| value))
    }

    async fn len(&mut self, key: &str) -> Result<usize> {
        let len: usize = ::redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut self.conn)
            .await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_url() {
        let config = RedisBufferConfig {
            host: "redis".to_string(),
            port: 6380,
            db: 2,
            ..Default::default()
        };
        assert_eq!(config.url(), "redis://redis:6380/2");
    }

    #[test]
    fn test_pop_timeout_has_floor() {
        let config = RedisBufferConfig {
            pop_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.pop_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_response_timeout_outlasts_pop() {
        let config = RedisBufferConfig {
            pop_timeout_secs: 5,
            ..Default::default()
        };
        assert!(config.response_timeout() > config.pop_timeout());
    }
}
