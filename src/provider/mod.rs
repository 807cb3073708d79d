//! Broker provider trait: the core abstraction for message sources
//!
//! Brokers (NATS JetStream, in-memory, etc.) implement `BrokerProvider` to
//! declare the sources the service consumes, open per-task subscriptions on
//! them and publish into them.

use crate::error::{AuditError, Result};
use crate::headers::MessageHeaders;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

pub mod memory;
pub mod nats;

/// A message source the service consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDef {
    /// Durable work queue shared by competing consumers
    Queue { name: String },

    /// Queue bound to a topic exchange with a wildcard routing pattern
    Topic {
        exchange: String,
        pattern: String,
        queue: String,
    },
}

impl SourceDef {
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue { name: name.into() }
    }

    pub fn topic(
        exchange: impl Into<String>,
        pattern: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self::Topic {
            exchange: exchange.into(),
            pattern: pattern.into(),
            queue: queue.into(),
        }
    }

    /// Name of the queue messages are consumed from
    pub fn queue_name(&self) -> &str {
        match self {
            Self::Queue { name } => name,
            Self::Topic { queue, .. } => queue,
        }
    }
}

impl fmt::Display for SourceDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue { name } => write!(f, "{}", name),
            Self::Topic {
                exchange,
                pattern,
                queue,
            } => write!(f, "{} <- {}[{}]", queue, exchange, pattern),
        }
    }
}

/// Where a published message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Straight into a named queue
    Queue(String),

    /// Through a topic exchange with a routing key
    Exchange { exchange: String, routing_key: String },
}

impl Route {
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue(name.into())
    }

    pub fn exchange(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self::Exchange {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(name) => write!(f, "{}", name),
            Self::Exchange {
                exchange,
                routing_key,
            } => write!(f, "{}/{}", exchange, routing_key),
        }
    }
}

/// A delivered message (already acknowledged to the broker)
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Bytes,
    pub headers: MessageHeaders,
}

impl Delivery {
    pub fn new(payload: impl Into<Bytes>, headers: MessageHeaders) -> Self {
        Self {
            payload: payload.into(),
            headers,
        }
    }

    /// Payload as UTF-8 text
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| AuditError::parse("payload", format!("not UTF-8: {}", e)))
    }

    /// Payload rendered for logs, lossy for non-UTF-8 bytes
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Core trait for broker backends
#[async_trait]
pub trait BrokerProvider: Send + Sync {
    /// Make sure the source (and whatever backs it) exists
    async fn declare(&self, source: &SourceDef) -> Result<()>;

    /// Open a subscription owned by a single task
    ///
    /// Several subscriptions on the same `Queue` compete for messages.
    async fn subscribe(&self, source: &SourceDef) -> Result<Box<dyn Subscription>>;

    /// Publish a message
    async fn publish(&self, route: &Route, payload: Bytes, headers: &MessageHeaders)
        -> Result<()>;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Health check; returns true if the provider is connected and operational
    async fn health(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Async subscription handle for receiving deliveries
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery; `None` once the source is closed
    ///
    /// Must be cancel-safe: dropping the future loses no message.
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_spec_queue_name() {
        assert_eq!(SourceDef::queue("audit_event").queue_name(), "audit_event");
        let topic = SourceDef::topic("quote_broadcast", "*.fresh", "quote_logger_1");
        assert_eq!(topic.queue_name(), "quote_logger_1");
        assert_eq!(topic.to_string(), "quote_logger_1 <- quote_broadcast[*.fresh]");
    }

    #[test]
    fn test_route_display() {
        assert_eq!(Route::queue("dumplog").to_string(), "dumplog");
        assert_eq!(
            Route::exchange("quote_broadcast", "abc.fresh").to_string(),
            "quote_broadcast/abc.fresh"
        );
    }

    #[test]
    fn test_delivery_text() {
        let delivery = Delivery::new(Bytes::from_static(b"u1,mine"), MessageHeaders::new());
        assert_eq!(delivery.text().unwrap(), "u1,mine");

        let bad = Delivery::new(Bytes::from_static(&[0xff, 0xfe]), MessageHeaders::new());
        assert!(bad.text().unwrap_err().is_per_item());
        assert_eq!(bad.text_lossy(), "\u{fffd}\u{fffd}");
    }
}
