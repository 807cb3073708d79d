//! In-memory durable buffer for tests and single-process use
//!
//! Not durable across restarts; everything else (FIFO per key, atomic pop,
//! blocking pop with timeout) matches the Redis backend.

use super::{BufferConnection, DurableBuffer};
use crate::error::{AuditError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Shared {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    notify: Notify,
    unavailable: AtomicBool,
}

/// In-memory buffer backend
#[derive(Clone, Default)]
pub struct MemoryBuffer {
    shared: Arc<Shared>,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lists(&self) -> MutexGuard<'_, HashMap<String, VecDeque<String>>> {
        self.shared.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the items waiting under `key`
    pub fn items(&self, key: &str) -> Vec<String> {
        self.lists()
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Simulate an outage: every push and pop fails until restored
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            Err(AuditError::Buffer("memory buffer unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DurableBuffer for MemoryBuffer {
    async fn connection(&self) -> Result<Box<dyn BufferConnection>> {
        self.check_available()?;
        Ok(Box::new(MemoryBufferConnection {
            buffer: self.clone(),
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Connection to a [`MemoryBuffer`]
pub struct MemoryBufferConnection {
    buffer: MemoryBuffer,
}

#[async_trait]
impl BufferConnection for MemoryBufferConnection {
    async fn push(&mut self, key: &str, value: &str) -> Result<()> {
        self.buffer.check_available()?;
        self.buffer
            .lists()
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        self.buffer.shared.notify.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(&mut self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.buffer.check_available()?;

            let notified = self.buffer.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let head = self.buffer.lists().get_mut(key).and_then(VecDeque::pop_front);
            if let Some(item) = head {
                return Ok(Some(item));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&mut self, key: &str) -> Result<usize> {
        self.buffer.check_available()?;
        Ok(self.buffer.lists().get(key).map(VecDeque::len).unwrap_or(0))
    }
}
