//! # a3s-audit
//!
//! Audit-trail ingestion, durable buffering, persistence and dumplog export
//! for the A3S trading platform.
//!
//! ## Overview
//!
//! Commands and price quotes published on the broker are validated,
//! appended to a durable worklist, and drained by a pool of insert workers
//! into the `Logs` table. Dump requests stream a user's (or everyone's)
//! history into an XML document that is always closed, even when the export
//! fails part way.
//!
//! ```text
//! broker ─▶ Consumer ─▶ DurableBuffer ─▶ InsertWorker ─▶ AuditStore
//!                                                            │
//!                         dumplog request ─▶ ExportEngine ◀──┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_audit::buffer::MemoryBuffer;
//! use a3s_audit::provider::memory::MemoryBroker;
//! use a3s_audit::store::MemoryStore;
//! use a3s_audit::{AuditContext, AuditService, PipelineSettings};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_audit::Result<()> {
//! let ctx = Arc::new(AuditContext::new(
//!     Arc::new(MemoryBroker::new()),
//!     Arc::new(MemoryBuffer::new()),
//!     Arc::new(MemoryStore::new()),
//!     PipelineSettings::new("logs"),
//! ));
//!
//! let handle = AuditService::start(ctx).await?;
//! let report = handle.shutdown().await;
//! println!("inserted {} events", report.workers.inserted);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **broker**: NATS JetStream, or the in-memory broker
//! - **buffer**: Redis lists, or the in-memory buffer
//! - **store**: PostgreSQL, or the in-memory store
//!
//! ## Architecture
//!
//! - **BrokerProvider** / **DurableBuffer** / **AuditStore**: backend traits
//! - **Consumer** + **DeliveryHandler**: one loop per feed subscription
//! - **InsertWorker**: buffer to store, one connection each
//! - **ExportEngine** + **DumplogDocument**: always-finalized XML export
//! - **AuditService** / **ServiceHandle**: startup, single shutdown signal

pub mod buffer;
pub mod config;
pub mod error;
pub mod export;
pub mod headers;
pub mod ingest;
pub mod provider;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod types;
pub mod worker;

// Re-export core types
pub use buffer::{BufferConnection, DurableBuffer};
pub use config::{AuditConfig, PipelineSettings, SourceNames, WorkerCounts};
pub use error::{AuditError, Result};
pub use export::{DumplogDocument, ExportEngine, ExportReport};
pub use headers::MessageHeaders;
pub use ingest::{Consumer, ConsumerReport, DeliveryHandler};
pub use provider::{BrokerProvider, Delivery, Route, SourceDef, Subscription};
pub use service::{AuditContext, AuditService, ServiceHandle, ServiceReport};
pub use shutdown::Shutdown;
pub use store::{AuditStore, LogFilter, LogRow, StoreConnection};
pub use types::{AuditEvent, DumplogRequest, EventType, LogItem, Quote};
pub use worker::{InsertWorker, WorkerReport};
