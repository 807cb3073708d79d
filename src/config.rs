//! Service configuration
//!
//! Loaded from a TOML file. Every section and field has a default, so a
//! partial file only needs the values that differ:
//!
//! ```toml
//! [broker]
//! url = "nats://broker:4222"
//!
//! [database]
//! host = "db"
//! user = "auditor"
//! password = "secret"
//! auditdb = "audit"
//!
//! [redis]
//! host = "cache"
//! key_prefix = "audit"
//!
//! [workers]
//! ingest = 2
//! insert = 8
//! dumplog = 1
//! ```

use crate::buffer::{pending_events_key, RedisBufferConfig};
use crate::error::{AuditError, Result};
use crate::provider::nats::NatsConfig;
use crate::store::DatabaseConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Names of the broker sources the service consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceNames {
    /// Command/audit event queue
    pub audit_queue: String,
    /// Dumplog request queue
    pub dumplog_queue: String,
    /// Quote broadcast exchange
    pub quote_exchange: String,
    /// Base name of the per-instance quote queue
    pub quote_queue: String,
    /// Routing pattern selecting fresh quotes
    pub quote_pattern: String,
}

impl Default for SourceNames {
    fn default() -> Self {
        Self {
            audit_queue: "audit_event".to_string(),
            dumplog_queue: "dumplog".to_string(),
            quote_exchange: "quote_broadcast".to_string(),
            quote_queue: "quote_logger".to_string(),
            quote_pattern: "*.fresh".to_string(),
        }
    }
}

/// Task counts per pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCounts {
    /// Competing command feed consumers
    #[serde(alias = "rmq")]
    pub ingest: usize,
    /// Insert workers draining the buffer
    pub insert: usize,
    /// Dumplog request consumers
    pub dumplog: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self {
            ingest: 1,
            insert: 4,
            dumplog: 1,
        }
    }
}

impl WorkerCounts {
    /// Buffer connections held while the service runs (the quote consumer
    /// holds one too)
    pub fn buffer_connections(&self) -> usize {
        self.ingest + 1 + self.insert
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub broker: NatsConfig,
    pub sources: SourceNames,
    pub database: DatabaseConfig,
    pub redis: RedisBufferConfig,
    pub workers: WorkerCounts,
}

impl AuditConfig {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AuditError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| AuditError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let workers = &self.workers;
        if workers.ingest == 0 || workers.insert == 0 || workers.dumplog == 0 {
            return Err(AuditError::Config(format!(
                "every worker pool needs at least one task (ingest={}, insert={}, dumplog={})",
                workers.ingest, workers.insert, workers.dumplog
            )));
        }

        let needed = workers.buffer_connections();
        if self.redis.max_active < needed {
            return Err(AuditError::Config(format!(
                "redis.max_active is {} but the worker pools hold {} connections",
                self.redis.max_active, needed
            )));
        }

        let store_needed = workers.insert + workers.dumplog;
        if (self.database.max_connections as usize) < store_needed {
            return Err(AuditError::Config(format!(
                "database.max_connections is {} but insert workers and exports need {}",
                self.database.max_connections, store_needed
            )));
        }

        let sources = &self.sources;
        for (field, value) in [
            ("audit_queue", &sources.audit_queue),
            ("dumplog_queue", &sources.dumplog_queue),
            ("quote_exchange", &sources.quote_exchange),
            ("quote_queue", &sources.quote_queue),
            ("quote_pattern", &sources.quote_pattern),
        ] {
            if value.trim().is_empty() {
                return Err(AuditError::Config(format!("sources.{} is empty", field)));
            }
        }
        Ok(())
    }

    /// Runtime settings for the pipeline
    pub fn pipeline_settings(&self, output_dir: impl Into<PathBuf>) -> PipelineSettings {
        PipelineSettings {
            sources: self.sources.clone(),
            buffer_key: pending_events_key(&self.redis.key_prefix),
            poll_timeout: self.redis.pop_timeout(),
            workers: self.workers,
            output_dir: output_dir.into(),
        }
    }
}

/// Resolved values the pipeline runs with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub sources: SourceNames,
    /// Worklist key of pending audit events
    pub buffer_key: String,
    /// Upper bound of one blocking pop
    pub poll_timeout: Duration,
    pub workers: WorkerCounts,
    /// Where dumplog documents are written
    pub output_dir: PathBuf,
}

impl PipelineSettings {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        AuditConfig::default().pipeline_settings(output_dir)
    }

    pub fn with_workers(mut self, workers: WorkerCounts) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }
}
