//! Relational audit store
//!
//! One row per audit event in the `Logs` table:
//! `(id, user_id, tx_id, event_type, content, created_at)`. Rows are
//! inserted by persistence workers and streamed back out by the dumplog
//! export engine. Each task acquires its own [`StoreConnection`].

use crate::error::Result;
use crate::types::{DumplogRequest, EventType, LogItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::{DatabaseConfig, PostgresStore};

/// Insert statement; parameters are (user_id, tx_id, event_type, content)
pub const INSERT_LOG_QUERY: &str =
    "INSERT INTO Logs(user_id, tx_id, event_type, content) VALUES($1, $2, $3, $4)";

/// A stored log row
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LogRow {
    pub id: i64,
    pub user_id: String,
    pub tx_id: i64,
    pub event_type: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl LogRow {
    pub fn kind(&self) -> Result<EventType> {
        self.event_type.parse()
    }
}

/// Which rows an export reads
///
/// Only quote and command rows are ever exported; `user_id` narrows the
/// export to one user, `None` covers everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub user_id: Option<String>,
}

impl LogFilter {
    pub fn all() -> Self {
        Self { user_id: None }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    /// Filter for a dump request; the admin sentinel reads every user
    pub fn for_request(request: &DumplogRequest) -> Self {
        if request.is_admin() {
            Self::all()
        } else {
            Self::user(request.user_id.clone())
        }
    }

    pub fn matches(&self, row: &LogRow) -> bool {
        let exported_kind = row.kind().is_ok();
        let user_ok = self.user_id.as_deref().map_or(true, |u| u == row.user_id);
        exported_kind && user_ok
    }
}

/// Shared handle to a store backend
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Acquire a connection owned by one task
    async fn connect(&self) -> Result<Box<dyn StoreConnection>>;

    /// Backend name (e.g., "postgres", "memory")
    fn name(&self) -> &str;

    /// Release backend resources once every connection is closed
    async fn shutdown(&self) {}
}

/// Per-task store connection
#[async_trait]
pub trait StoreConnection: Send {
    /// Insert one log row
    async fn insert(&mut self, item: &LogItem) -> Result<()>;

    /// Stream matching rows ordered by creation time, oldest first
    fn fetch_logs<'a>(&'a mut self, filter: &'a LogFilter) -> BoxStream<'a, Result<LogRow>>;

    /// Give the connection back
    async fn close(self: Box<Self>) -> Result<()>;
}
