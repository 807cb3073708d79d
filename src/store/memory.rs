//! In-memory audit store for tests and single-process use
//!
//! Rows get strictly increasing ids and `created_at` stamps. Failures can
//! be injected per user on insert, part way through an export stream, or
//! by severing every open connection as a database restart would.

use super::{AuditStore, LogFilter, LogRow, StoreConnection};
use crate::error::{AuditError, Result};
use crate::types::LogItem;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct StoreState {
    rows: Vec<LogRow>,
    next_id: i64,
    failing_users: HashSet<String>,
    fail_fetch_after: Option<usize>,
    unavailable: bool,
    open_connections: usize,
    generation: u64,
}

/// In-memory store backend
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every row in insertion order
    pub fn rows(&self) -> Vec<LogRow> {
        self.state().rows.clone()
    }

    pub fn len(&self) -> usize {
        self.state().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connections acquired and not yet closed
    pub fn open_connections(&self) -> usize {
        self.state().open_connections
    }

    /// Make every insert for `user_id` fail
    pub fn fail_inserts_for(&self, user_id: impl Into<String>) {
        self.state().failing_users.insert(user_id.into());
    }

    /// Make export streams fail after yielding `rows` rows
    pub fn fail_fetch_after(&self, rows: Option<usize>) {
        self.state().fail_fetch_after = rows;
    }

    /// Refuse new connections
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Sever every connection handed out so far
    ///
    /// Severed connections fail with [`AuditError::StoreUnavailable`];
    /// connections acquired afterwards work normally.
    pub fn sever_connections(&self) {
        self.state().generation += 1;
    }

    /// Insert a row with an explicit timestamp
    pub fn insert_at(&self, item: &LogItem, created_at: DateTime<Utc>) -> Result<i64> {
        self.insert_row(item, Some(created_at), None)
    }

    fn insert_row(
        &self,
        item: &LogItem,
        created_at: Option<DateTime<Utc>>,
        generation: Option<u64>,
    ) -> Result<i64> {
        let mut state = self.state();
        if generation.is_some_and(|g| g != state.generation) {
            return Err(AuditError::StoreUnavailable(
                "connection severed".to_string(),
            ));
        }
        if state.failing_users.contains(&item.user_id) {
            return Err(AuditError::Store(format!(
                "insert rejected for user {}",
                item.user_id
            )));
        }

        let created_at = created_at.unwrap_or_else(|| {
            let now = Utc::now();
            match state.rows.iter().map(|r| r.created_at).max() {
                Some(last) if last >= now => last + Duration::microseconds(1),
                _ => now,
            }
        });

        state.next_id += 1;
        let id = state.next_id;
        state.rows.push(LogRow {
            id,
            user_id: item.user_id.clone(),
            tx_id: item.tx_id,
            event_type: item.log_type.as_str().to_string(),
            content: item.content.clone(),
            created_at,
        });
        Ok(id)
    }

    fn matching_rows(&self, filter: &LogFilter) -> (Vec<LogRow>, Option<usize>) {
        let state = self.state();
        let mut rows: Vec<LogRow> = state
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        (rows, state.fail_fetch_after)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>> {
        let mut state = self.state();
        if state.unavailable {
            return Err(AuditError::StoreUnavailable(
                "memory store unavailable".to_string(),
            ));
        }
        state.open_connections += 1;
        Ok(Box::new(MemoryStoreConnection {
            store: self.clone(),
            generation: state.generation,
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Connection to a [`MemoryStore`]
pub struct MemoryStoreConnection {
    store: MemoryStore,
    generation: u64,
}

#[async_trait]
impl StoreConnection for MemoryStoreConnection {
    async fn insert(&mut self, item: &LogItem) -> Result<()> {
        self.store
            .insert_row(item, None, Some(self.generation))
            .map(|_| ())
    }

    fn fetch_logs<'a>(&'a mut self, filter: &'a LogFilter) -> BoxStream<'a, Result<LogRow>> {
        let (rows, fail_after) = self.store.matching_rows(filter);
        match fail_after {
            Some(limit) => {
                let failure = AuditError::Store(format!("row stream failed after {} rows", limit));
                stream::iter(rows.into_iter().take(limit).map(Ok))
                    .chain(stream::once(async move { Err(failure) }))
                    .boxed()
            }
            None => stream::iter(rows.into_iter().map(Ok)).boxed(),
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut state = self.store.state();
        state.open_connections = state.open_connections.saturating_sub(1);
        Ok(())
    }
}
