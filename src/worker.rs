//! Persistence worker pool
//!
//! Each [`InsertWorker`] owns one buffer connection and one store
//! connection. It pops pending events one at a time and inserts them.
//! Malformed entries and rejected inserts are logged and skipped.
//!
//! A lost store connection is not an item failure: the worker holds on to
//! the popped event, acquires a fresh connection from the store and retries
//! until the insert lands. If shutdown arrives first the event is pushed
//! back onto the worklist.
//!
//! A blocking pop is never cancelled: the shutdown signal is checked
//! between polls, so a worker exits at most one poll timeout after the
//! signal and never drops an item it already took off the buffer.

use crate::buffer::BufferConnection;
use crate::error::{AuditError, Result};
use crate::shutdown::Shutdown;
use crate::store::{AuditStore, StoreConnection};
use crate::types::{AuditEvent, LogItem};
use std::sync::Arc;
use std::time::Duration;

/// Counters reported by an insert worker when it stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub inserted: u64,
    pub malformed: u64,
    pub failed: u64,
    /// Events pushed back because shutdown came during a reconnect
    pub requeued: u64,
}

impl WorkerReport {
    pub fn merge(&mut self, other: &WorkerReport) {
        self.inserted += other.inserted;
        self.malformed += other.malformed;
        self.failed += other.failed;
        self.requeued += other.requeued;
    }
}

/// Drains the pending-events worklist into the audit store
pub struct InsertWorker {
    id: usize,
    buffer: Box<dyn BufferConnection>,
    store: Arc<dyn AuditStore>,
    conn: Option<Box<dyn StoreConnection>>,
    key: String,
    poll_timeout: Duration,
    shutdown: Shutdown,
}

impl InsertWorker {
    pub fn new(
        id: usize,
        buffer: Box<dyn BufferConnection>,
        store: Arc<dyn AuditStore>,
        conn: Box<dyn StoreConnection>,
        key: impl Into<String>,
        poll_timeout: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            id,
            buffer,
            store,
            conn: Some(conn),
            key: key.into(),
            poll_timeout,
            shutdown,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Work until the shutdown signal, then close the store connection
    pub async fn run(mut self) -> WorkerReport {
        let mut report = WorkerReport::default();
        tracing::info!(worker = self.id, key = %self.key, "Insert worker started");

        while !self.shutdown.is_triggered() {
            let raw = match self.buffer.blocking_pop(&self.key, self.poll_timeout).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    tracing::trace!(worker = self.id, key = %self.key, "No new entries");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(worker = self.id, key = %self.key, error = %e, "Buffer pop failed");
                    tokio::select! {
                        _ = self.shutdown.wait() => break,
                        _ = tokio::time::sleep(self.poll_timeout) => continue,
                    }
                }
            };

            let item = match AuditEvent::decode(&raw) {
                Ok(event) => LogItem::from(event),
                Err(e) => {
                    report.malformed += 1;
                    tracing::error!(worker = self.id, raw = %raw, error = %e, "Could not parse audit event");
                    continue;
                }
            };

            match self.insert(&item).await {
                Ok(()) => {
                    report.inserted += 1;
                    tracing::debug!(
                        worker = self.id,
                        user_id = %item.user_id,
                        tx_id = item.tx_id,
                        event_type = %item.log_type,
                        "Inserted log"
                    );
                }
                Err(e) if e.is_connection_lost() => {
                    self.requeue(&raw, &mut report).await;
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(worker = self.id, raw = %raw, error = %e, "Problem inserting log");
                }
            }
        }

        self.release().await;
        tracing::info!(
            worker = self.id,
            inserted = report.inserted,
            malformed = report.malformed,
            failed = report.failed,
            requeued = report.requeued,
            "Finished inserting logs"
        );
        report
    }

    /// Insert `item`, replacing the store connection whenever it is lost
    ///
    /// Returns a connection-lost error only when shutdown interrupts the
    /// reconnect back-off.
    async fn insert(&mut self, item: &LogItem) -> Result<()> {
        loop {
            let err = match self.connection().await {
                Ok(conn) => match conn.insert(item).await {
                    Err(e) if e.is_connection_lost() => e,
                    other => return other,
                },
                Err(e) => e,
            };

            self.release().await;
            tracing::warn!(
                worker = self.id,
                tx_id = item.tx_id,
                error = %err,
                "Store connection lost; reconnecting"
            );
            tokio::select! {
                _ = self.shutdown.wait() => {
                    return Err(match err {
                        e @ AuditError::StoreUnavailable(_) => e,
                        other => AuditError::StoreUnavailable(other.to_string()),
                    });
                }
                _ = tokio::time::sleep(self.poll_timeout) => {}
            }
        }
    }

    async fn connection(&mut self) -> Result<&mut Box<dyn StoreConnection>> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let conn = self.store.connect().await?;
                tracing::info!(worker = self.id, store = self.store.name(), "Store connection re-acquired");
                conn
            }
        };
        Ok(self.conn.insert(conn))
    }

    async fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                tracing::warn!(worker = self.id, error = %e, "Failed to close store connection");
            }
        }
    }

    async fn requeue(&mut self, raw: &str, report: &mut WorkerReport) {
        match self.buffer.push(&self.key, raw).await {
            Ok(()) => {
                report.requeued += 1;
                tracing::warn!(worker = self.id, key = %self.key, "Pending event returned to the worklist");
            }
            Err(e) => {
                report.failed += 1;
                tracing::error!(worker = self.id, raw = %raw, error = %e, "Pending event lost: store and buffer both unavailable");
            }
        }
    }
}
