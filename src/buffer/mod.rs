//! Durable buffer: the crash-resilient hand-off between ingestion and
//! persistence
//!
//! A buffer is a set of FIFO lists addressed by a well-known key per event
//! class. Producers append with [`BufferConnection::push`]; persistence
//! workers take the oldest item with [`BufferConnection::blocking_pop`].
//! Every task acquires its own connection from the shared [`DurableBuffer`].

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBuffer;
pub use self::redis::{RedisBuffer, RedisBufferConfig};

/// Suffix of the worklist key holding pending audit events
pub const PENDING_EVENTS_SUFFIX: &str = "pendingEvents";

/// Worklist key for pending audit events under a key prefix
pub fn pending_events_key(prefix: &str) -> String {
    if prefix.is_empty() {
        PENDING_EVENTS_SUFFIX.to_string()
    } else {
        format!("{}:{}", prefix, PENDING_EVENTS_SUFFIX)
    }
}

/// Shared handle to a buffer backend
#[async_trait]
pub trait DurableBuffer: Send + Sync {
    /// Acquire a connection owned by one task
    async fn connection(&self) -> Result<Box<dyn BufferConnection>>;

    /// Backend name (e.g., "redis", "memory")
    fn name(&self) -> &str;
}

/// Per-task buffer connection
#[async_trait]
pub trait BufferConnection: Send {
    /// Append an item to the tail of `key`
    async fn push(&mut self, key: &str, value: &str) -> Result<()>;

    /// Take the head of `key`, waiting up to `timeout`
    ///
    /// `Ok(None)` means the wait timed out with nothing to do.
    async fn blocking_pop(&mut self, key: &str, timeout: Duration) -> Result<Option<String>>;

    /// Number of items waiting under `key`
    async fn len(&mut self, key: &str) -> Result<usize>;
}
