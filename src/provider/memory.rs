//! In-memory broker for tests and single-process use
//!
//! Queues are FIFO lists shared by every subscription opened on them, so
//! subscriptions on the same queue compete for messages. Topic exchanges
//! route by routing-key pattern: `*` matches exactly one dot-separated
//! token, `#` (or `>`) matches all remaining tokens.

use super::{BrokerProvider, Delivery, Route, SourceDef, Subscription};
use crate::error::{AuditError, Result};
use crate::headers::MessageHeaders;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Delivery>,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    closed: bool,
}

/// In-memory broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of undelivered messages waiting in a queue
    pub fn pending(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Whether a queue has been declared
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    /// Close the broker; open subscriptions drain and then end
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
    }

    fn enqueue(state: &mut BrokerState, queue: &str, delivery: Delivery) -> bool {
        match state.queues.get_mut(queue) {
            Some(q) => {
                q.messages.push_back(delivery);
                q.notify.notify_waiters();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl BrokerProvider for MemoryBroker {
    async fn declare(&self, source: &SourceDef) -> Result<()> {
        let mut state = self.state();
        state
            .queues
            .entry(source.queue_name().to_string())
            .or_default();

        if let SourceDef::Topic {
            exchange,
            pattern,
            queue,
        } = source
        {
            let binding = Binding {
                exchange: exchange.clone(),
                pattern: pattern.clone(),
                queue: queue.clone(),
            };
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
        }

        tracing::debug!(source = %source, "Memory source declared");
        Ok(())
    }

    async fn subscribe(&self, source: &SourceDef) -> Result<Box<dyn Subscription>> {
        let state = self.state();
        let queue = source.queue_name();
        let notify = state
            .queues
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| AuditError::Subscribe {
                source_name: queue.to_string(),
                reason: "queue not declared".to_string(),
            })?;

        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
            queue: queue.to_string(),
            notify,
        }))
    }

    async fn publish(
        &self,
        route: &Route,
        payload: Bytes,
        headers: &MessageHeaders,
    ) -> Result<()> {
        let delivery = Delivery::new(payload, headers.clone());
        let mut state = self.state();

        match route {
            Route::Queue(name) => {
                if !Self::enqueue(&mut state, name, delivery) {
                    return Err(AuditError::Publish {
                        route: route.to_string(),
                        reason: "queue not declared".to_string(),
                    });
                }
            }
            Route::Exchange {
                exchange,
                routing_key,
            } => {
                let targets: Vec<String> = state
                    .bindings
                    .iter()
                    .filter(|b| &b.exchange == exchange && routing_matches(&b.pattern, routing_key))
                    .map(|b| b.queue.clone())
                    .collect();
                for queue in targets {
                    Self::enqueue(&mut state, &queue, delivery.clone());
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Subscription on an in-memory queue
pub struct MemorySubscription {
    broker: MemoryBroker,
    queue: String,
    notify: Arc<Notify>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.broker.state();
                if let Some(delivery) = state
                    .queues
                    .get_mut(&self.queue)
                    .and_then(|q| q.messages.pop_front())
                {
                    return Ok(Some(delivery));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }
}

/// Match a routing key against an AMQP-style topic pattern
pub fn routing_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    tokens_match(&pattern, &key)
}

fn tokens_match(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#") | Some(&">"), _) => true,
        (Some(&"*"), Some(_)) => tokens_match(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => tokens_match(&pattern[1..], &key[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_routing_matches() {
        assert!(routing_matches("*.fresh", "ABC.fresh"));
        assert!(!routing_matches("*.fresh", "ABC.stale"));
        assert!(!routing_matches("*.fresh", "a.b.fresh"));
        assert!(!routing_matches("*.fresh", "fresh"));
        assert!(routing_matches("quotes.#", "quotes.a.b"));
        assert!(routing_matches("quotes.>", "quotes.a"));
        assert!(routing_matches("exact.key", "exact.key"));
    }

    #[tokio::test]
    async fn test_queue_fifo() {
        let broker = MemoryBroker::new();
        let source = SourceDef::queue("audit_event");
        broker.declare(&source).await.unwrap();
        let mut sub = broker.subscribe(&source).await.unwrap();

        for i in 0..3 {
            broker
                .publish(
                    &Route::queue("audit_event"),
                    Bytes::from(format!("m{}", i)),
                    &MessageHeaders::new(),
                )
                .await
                .unwrap();
        }

        for i in 0..3 {
            let delivery = sub.next().await.unwrap().unwrap();
            assert_eq!(delivery.text().unwrap(), format!("m{}", i));
        }
        assert_eq!(broker.pending("audit_event"), 0);
    }

    #[tokio::test]
    async fn test_subscribe_undeclared_fails() {
        let broker = MemoryBroker::new();
        let err = broker.subscribe(&SourceDef::queue("nope")).await.err().unwrap();
        assert!(matches!(err, AuditError::Subscribe { .. }));
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_queue_fails() {
        let broker = MemoryBroker::new();
        let result = broker
            .publish(&Route::queue("nope"), Bytes::new(), &MessageHeaders::new())
            .await;
        assert!(matches!(result, Err(AuditError::Publish { .. })));
    }

    #[tokio::test]
    async fn test_topic_fanout_to_each_bound_queue() {
        let broker = MemoryBroker::new();
        let a = SourceDef::topic("quote_broadcast", "*.fresh", "logger_a");
        let b = SourceDef::topic("quote_broadcast", "*.fresh", "logger_b");
        broker.declare(&a).await.unwrap();
        broker.declare(&b).await.unwrap();

        broker
            .publish(
                &Route::exchange("quote_broadcast", "ABC.fresh"),
                Bytes::from_static(b"q"),
                &MessageHeaders::new(),
            )
            .await
            .unwrap();
        broker
            .publish(
                &Route::exchange("quote_broadcast", "ABC.cached"),
                Bytes::from_static(b"skip"),
                &MessageHeaders::new(),
            )
            .await
            .unwrap();

        assert_eq!(broker.pending("logger_a"), 1);
        assert_eq!(broker.pending("logger_b"), 1);
    }

    #[tokio::test]
    async fn test_next_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let source = SourceDef::queue("dumplog");
        broker.declare(&source).await.unwrap();
        let mut sub = broker.subscribe(&source).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish(
                    &Route::queue("dumplog"),
                    Bytes::from_static(b"u1,mine"),
                    &MessageHeaders::new(),
                )
                .await
                .unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.text().unwrap(), "u1,mine");
    }

    #[tokio::test]
    async fn test_close_ends_subscription() {
        let broker = MemoryBroker::new();
        let source = SourceDef::queue("audit_event");
        broker.declare(&source).await.unwrap();
        let mut sub = broker.subscribe(&source).await.unwrap();

        broker.close();
        assert!(sub.next().await.unwrap().is_none());
    }
}
