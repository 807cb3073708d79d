//! Ingestion consumers
//!
//! A [`Consumer`] drives one broker subscription and hands every delivery to
//! a [`DeliveryHandler`]. Per-item failures (bad payload, bad header) are
//! logged with the raw payload and skipped; anything the handler reports as
//! fatal ends the consumer with `Err`.

use crate::error::{AuditError, Result};
use crate::provider::{Delivery, Subscription};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use std::time::Duration;

pub mod command;
pub mod dumplog;
pub mod quote;

pub use command::CommandHandler;
pub use dumplog::DumplogHandler;
pub use quote::QuoteHandler;

/// Pause after a broker-side receive error
const DELIVERY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Per-delivery processing for one feed
#[async_trait]
pub trait DeliveryHandler: Send {
    /// Feed name used in logs
    fn kind(&self) -> &'static str;

    /// Process one delivery
    async fn handle(&mut self, delivery: &Delivery) -> Result<()>;

    /// Whether an error returned by `handle` must stop the consumer
    fn is_fatal(&self, error: &AuditError) -> bool {
        !error.is_per_item()
    }
}

/// Counters reported by a consumer when it stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub forwarded: u64,
    pub rejected: u64,
}

/// A subscription loop feeding one handler
pub struct Consumer {
    name: String,
    subscription: Box<dyn Subscription>,
    handler: Box<dyn DeliveryHandler>,
    shutdown: Shutdown,
}

impl Consumer {
    pub fn new(
        name: impl Into<String>,
        subscription: Box<dyn Subscription>,
        handler: Box<dyn DeliveryHandler>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            name: name.into(),
            subscription,
            handler,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume until shutdown, subscription end, or a fatal handler error
    pub async fn run(mut self) -> Result<ConsumerReport> {
        let mut report = ConsumerReport::default();
        tracing::info!(consumer = %self.name, feed = self.handler.kind(), "Consumer started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                next = self.subscription.next() => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tracing::info!(consumer = %self.name, "Subscription closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(consumer = %self.name, error = %e, "Receive failed");
                    tokio::select! {
                        _ = self.shutdown.wait() => break,
                        _ = tokio::time::sleep(DELIVERY_RETRY_DELAY) => continue,
                    }
                }
            };

            match self.handler.handle(&delivery).await {
                Ok(()) => report.forwarded += 1,
                Err(e) if self.handler.is_fatal(&e) => {
                    tracing::error!(
                        consumer = %self.name,
                        error = %e,
                        payload = %delivery.text_lossy(),
                        "Delivery path failed, stopping consumer"
                    );
                    return Err(e);
                }
                Err(e) => {
                    report.rejected += 1;
                    tracing::warn!(
                        consumer = %self.name,
                        error = %e,
                        payload = %delivery.text_lossy(),
                        "Dropped delivery"
                    );
                }
            }
        }

        tracing::info!(
            consumer = %self.name,
            forwarded = report.forwarded,
            rejected = report.rejected,
            "Consumer finished"
        );
        Ok(report)
    }
}
