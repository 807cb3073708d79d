//! Lifecycle coordinator
//!
//! [`AuditService::start`] declares every broker source, opens every
//! subscription and acquires every task's connections before spawning
//! anything, so a startup failure leaves nothing running. The returned
//! [`ServiceHandle`] owns the tasks and the single shutdown signal.
//!
//! Task layout:
//!
//! | Task | Count | Connections |
//! |---|---|---|
//! | command feed consumer | `workers.ingest` | subscription + buffer |
//! | quote feed consumer | 1 | subscription + buffer |
//! | dumplog consumer | `workers.dumplog` | subscription (+ store per export) |
//! | insert worker | `workers.insert` | buffer + store |

use crate::buffer::DurableBuffer;
use crate::config::PipelineSettings;
use crate::error::Result;
use crate::export::ExportEngine;
use crate::ingest::{CommandHandler, Consumer, ConsumerReport, DumplogHandler, QuoteHandler};
use crate::provider::{BrokerProvider, SourceDef};
use crate::shutdown::Shutdown;
use crate::store::AuditStore;
use crate::worker::{InsertWorker, WorkerReport};
use std::sync::Arc;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Shared resources handed to every task
pub struct AuditContext {
    pub broker: Arc<dyn BrokerProvider>,
    pub buffer: Arc<dyn DurableBuffer>,
    pub store: Arc<dyn AuditStore>,
    pub settings: PipelineSettings,
}

impl AuditContext {
    pub fn new(
        broker: Arc<dyn BrokerProvider>,
        buffer: Arc<dyn DurableBuffer>,
        store: Arc<dyn AuditStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            broker,
            buffer,
            store,
            settings,
        }
    }
}

enum TaskOutcome {
    Consumer { name: String, report: ConsumerReport },
    Worker { report: WorkerReport },
}

/// What every task did by the time the service stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceReport {
    /// Per-consumer counters, by consumer name
    pub consumers: Vec<(String, ConsumerReport)>,
    /// Insert worker counters, summed over the pool
    pub workers: WorkerReport,
    /// Tasks that ended with an error
    pub failures: Vec<String>,
}

impl ServiceReport {
    /// Whether every task stopped without error
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Deliveries forwarded by all consumers
    pub fn forwarded(&self) -> u64 {
        self.consumers.iter().map(|(_, r)| r.forwarded).sum()
    }

    /// Deliveries dropped by all consumers
    pub fn rejected(&self) -> u64 {
        self.consumers.iter().map(|(_, r)| r.rejected).sum()
    }
}

/// Entry point of the pipeline
pub struct AuditService;

impl AuditService {
    /// Set up every source and connection, then spawn all tasks
    pub async fn start(ctx: Arc<AuditContext>) -> Result<ServiceHandle> {
        let settings = &ctx.settings;
        let names = &settings.sources;
        let shutdown = Shutdown::new();

        let audit_source = SourceDef::queue(&names.audit_queue);
        let dumplog_source = SourceDef::queue(&names.dumplog_queue);
        let quote_queue = format!("{}_{}", names.quote_queue, Uuid::new_v4().simple());
        let quote_source =
            SourceDef::topic(&names.quote_exchange, &names.quote_pattern, quote_queue.clone());

        for source in [&audit_source, &dumplog_source, &quote_source] {
            ctx.broker.declare(source).await?;
            tracing::debug!(source = %source, broker = ctx.broker.name(), "Declared source");
        }

        let exporter = ExportEngine::new(ctx.store.clone(), settings.output_dir.clone());
        let mut consumers = Vec::new();

        for id in 1..=settings.workers.ingest {
            let subscription = ctx.broker.subscribe(&audit_source).await?;
            let handler = CommandHandler::new(ctx.buffer.connection().await?, &settings.buffer_key);
            consumers.push(Consumer::new(
                format!("audit_event_worker_{}", id),
                subscription,
                Box::new(handler),
                shutdown.clone(),
            ));
        }

        let subscription = ctx.broker.subscribe(&quote_source).await?;
        let handler = QuoteHandler::new(ctx.buffer.connection().await?, &settings.buffer_key);
        consumers.push(Consumer::new(
            "quote_catcher",
            subscription,
            Box::new(handler),
            shutdown.clone(),
        ));

        for id in 1..=settings.workers.dumplog {
            let subscription = ctx.broker.subscribe(&dumplog_source).await?;
            consumers.push(Consumer::new(
                format!("dumplog_watcher_{}", id),
                subscription,
                Box::new(DumplogHandler::new(exporter.clone())),
                shutdown.clone(),
            ));
        }

        let mut workers = Vec::new();
        for id in 1..=settings.workers.insert {
            workers.push(InsertWorker::new(
                id,
                ctx.buffer.connection().await?,
                ctx.store.clone(),
                ctx.store.connect().await?,
                &settings.buffer_key,
                settings.poll_timeout,
                shutdown.clone(),
            ));
        }

        let mut tasks = JoinSet::new();
        for consumer in consumers {
            let name = consumer.name().to_string();
            tasks.spawn(async move {
                let report = consumer.run().await?;
                Ok(TaskOutcome::Consumer { name, report })
            });
        }
        for worker in workers {
            tasks.spawn(async move {
                let report = worker.run().await;
                Ok(TaskOutcome::Worker { report })
            });
        }

        tracing::info!(
            broker = ctx.broker.name(),
            buffer = ctx.buffer.name(),
            store = ctx.store.name(),
            key = %settings.buffer_key,
            quote_queue = %quote_queue,
            tasks = tasks.len(),
            "Audit service started"
        );

        Ok(ServiceHandle {
            shutdown,
            tasks,
            exporter,
            quote_queue,
        })
    }
}

/// Running service
pub struct ServiceHandle {
    shutdown: Shutdown,
    tasks: JoinSet<Result<TaskOutcome>>,
    exporter: ExportEngine,
    quote_queue: String,
}

impl ServiceHandle {
    /// The signal every task observes
    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Export engine over the same store; usable at any time
    pub fn exporter(&self) -> &ExportEngine {
        &self.exporter
    }

    /// Queue this instance bound to the quote exchange
    pub fn quote_queue(&self) -> &str {
        &self.quote_queue
    }

    /// Wait for every task to finish
    ///
    /// Tasks run until the shutdown signal. A task that fails, or a
    /// consumer whose feed ends on its own, triggers it.
    pub async fn wait(mut self) -> ServiceReport {
        let mut report = ServiceReport::default();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(TaskOutcome::Consumer { name, report: counts })) => {
                    if !self.shutdown.is_triggered() {
                        tracing::warn!(consumer = %name, "Feed ended before shutdown, stopping service");
                        self.shutdown.trigger();
                    }
                    report.consumers.push((name, counts));
                }
                Ok(Ok(TaskOutcome::Worker { report: counts })) => report.workers.merge(&counts),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Task failed, stopping service");
                    report.failures.push(e.to_string());
                    self.shutdown.trigger();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Task aborted, stopping service");
                    report.failures.push(e.to_string());
                    self.shutdown.trigger();
                }
            }
        }

        report.consumers.sort_by(|a, b| a.0.cmp(&b.0));
        tracing::info!(
            forwarded = report.forwarded(),
            rejected = report.rejected(),
            inserted = report.workers.inserted,
            failures = report.failures.len(),
            "Audit service stopped"
        );
        report
    }

    /// Trigger the shutdown signal and wait for every task
    pub async fn shutdown(self) -> ServiceReport {
        self.shutdown.trigger();
        self.wait().await
    }
}
