//! NATS JetStream broker provider
//!
//! Implements `BrokerProvider` on NATS JetStream. Durable queues and topic
//! exchanges become streams; queue consumption is a durable pull consumer
//! shared by every subscription opened on it.

mod client;
mod config;
mod subscriber;

pub use client::NatsClient;
pub use config::{NatsConfig, StorageType};
pub use subscriber::NatsSubscription;

use crate::error::Result;
use crate::headers::MessageHeaders;
use crate::provider::{BrokerProvider, Route, SourceDef, Subscription};
use async_trait::async_trait;
use bytes::Bytes;

/// NATS JetStream broker provider
///
/// Wraps `NatsClient` and implements the `BrokerProvider` trait.
pub struct NatsProvider {
    client: NatsClient,
}

impl NatsProvider {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl BrokerProvider for NatsProvider {
    async fn declare(&self, source: &SourceDef) -> Result<()> {
        self.client.declare(source).await
    }

    async fn subscribe(&self, source: &SourceDef) -> Result<Box<dyn Subscription>> {
        let sub = self.client.subscribe(source).await?;
        Ok(Box::new(sub))
    }

    async fn publish(
        &self,
        route: &Route,
        payload: Bytes,
        headers: &MessageHeaders,
    ) -> Result<()> {
        self.client.publish(route, payload, headers).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }

    async fn health(&self) -> Result<bool> {
        self.client.flush().await.map(|_| true)
    }
}
