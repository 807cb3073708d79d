//! NATS JetStream client: connect, declare, publish, subscribe

use super::config::{consumer_name, NatsConfig, StorageType};
use super::subscriber::NatsSubscription;
use crate::error::{AuditError, Result};
use crate::headers::{self, MessageHeaders};
use crate::provider::{Route, SourceDef};
use async_nats::jetstream;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// NATS JetStream client
///
/// Low-level client that maps queues and topic exchanges onto JetStream
/// streams and pull consumers.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// JetStream context
    jetstream: jetstream::Context,

    /// Configuration
    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| AuditError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            config: Arc::new(config),
        })
    }

    /// Ensure the stream and consumer behind a source exist
    pub async fn declare(&self, source: &SourceDef) -> Result<()> {
        let stream = self.ensure_stream(source).await?;
        let consumer = consumer_config(&self.config, source);
        let name = consumer_name(source.queue_name());

        stream
            .get_or_create_consumer(&name, consumer)
            .await
            .map_err(|e| AuditError::Declare {
                source_name: source.to_string(),
                reason: format!("consumer '{}': {}", name, e),
            })?;

        tracing::info!(source = %source, consumer = %name, "Source declared");
        Ok(())
    }

    /// Open a pull subscription on the durable consumer behind a source
    pub async fn subscribe(&self, source: &SourceDef) -> Result<NatsSubscription> {
        let stream_name = stream_name(&self.config, source);
        let name = consumer_name(source.queue_name());
        let subscribe_err = |reason: String| AuditError::Subscribe {
            source_name: source.to_string(),
            reason,
        };

        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|e| subscribe_err(format!("stream '{}': {}", stream_name, e)))?;

        let consumer = stream
            .get_or_create_consumer(&name, consumer_config(&self.config, source))
            .await
            .map_err(|e| subscribe_err(format!("consumer '{}': {}", name, e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| subscribe_err(e.to_string()))?;

        tracing::info!(source = %source, consumer = %name, "Subscription opened");

        Ok(NatsSubscription::new(messages, source.to_string()))
    }

    /// Publish a message and wait for the JetStream ack
    pub async fn publish(
        &self,
        route: &Route,
        payload: Bytes,
        message_headers: &MessageHeaders,
    ) -> Result<u64> {
        let subject = match route {
            Route::Queue(name) => name.clone(),
            Route::Exchange {
                exchange,
                routing_key,
            } => self.config.exchange_subject(exchange, routing_key),
        };
        let publish_err = |reason: String| AuditError::Publish {
            route: route.to_string(),
            reason,
        };

        let mut nats_headers = async_nats::HeaderMap::new();
        for (name, value) in message_headers.iter() {
            nats_headers.insert(name, value);
        }

        let ack = self
            .jetstream
            .publish_with_headers(subject.clone(), nats_headers, payload)
            .await
            .map_err(|e| publish_err(e.to_string()))?
            .await
            .map_err(|e| publish_err(format!("ack failed: {}", e)))?;

        tracing::debug!(subject = %subject, sequence = ack.sequence, "Message published");
        Ok(ack.sequence)
    }

    /// Round-trip to the server
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| AuditError::Connection(format!("flush failed: {}", e)))
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    async fn ensure_stream(&self, source: &SourceDef) -> Result<jetstream::stream::Stream> {
        let storage = match self.config.storage {
            StorageType::File => jetstream::stream::StorageType::File,
            StorageType::Memory => jetstream::stream::StorageType::Memory,
        };

        let subjects = match source {
            SourceDef::Queue { name } => vec![name.clone()],
            SourceDef::Topic { exchange, .. } => vec![format!("{}.>", exchange)],
        };
        let name = stream_name(&self.config, source);

        let stream_config = jetstream::stream::Config {
            name: name.clone(),
            subjects: subjects.clone(),
            storage,
            max_age: Duration::from_secs(self.config.max_age_secs),
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| AuditError::Declare {
                source_name: source.to_string(),
                reason: format!("stream '{}': {}", name, e),
            })?;

        tracing::debug!(stream = %name, subjects = ?subjects, "JetStream stream ready");
        Ok(stream)
    }
}

fn stream_name(config: &NatsConfig, source: &SourceDef) -> String {
    match source {
        SourceDef::Queue { name } => config.queue_stream(name),
        SourceDef::Topic { exchange, .. } => config.exchange_stream(exchange),
    }
}

/// Pull consumer config for a source
///
/// Deliveries are not acked individually (auto-ack). Topic-bound consumers
/// only see messages published after they were created and are reaped once
/// idle, so per-instance quote queues do not pile up.
fn consumer_config(config: &NatsConfig, source: &SourceDef) -> jetstream::consumer::pull::Config {
    let name = consumer_name(source.queue_name());
    match source {
        SourceDef::Queue { name: queue } => jetstream::consumer::pull::Config {
            durable_name: Some(name),
            filter_subject: queue.clone(),
            ack_policy: jetstream::consumer::AckPolicy::None,
            deliver_policy: jetstream::consumer::DeliverPolicy::All,
            ..Default::default()
        },
        SourceDef::Topic {
            exchange, pattern, ..
        } => jetstream::consumer::pull::Config {
            durable_name: Some(name),
            filter_subject: config.binding_filter(exchange, pattern),
            ack_policy: jetstream::consumer::AckPolicy::None,
            deliver_policy: jetstream::consumer::DeliverPolicy::New,
            inactive_threshold: Duration::from_secs(config.topic_consumer_ttl_secs),
            ..Default::default()
        },
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Lift the headers the service understands out of a NATS header map
pub(crate) fn message_headers(nats_headers: Option<&async_nats::HeaderMap>) -> MessageHeaders {
    let mut out = MessageHeaders::new();
    if let Some(map) = nats_headers {
        for name in [
            headers::TRANSACTION_ID,
            headers::USER_ID,
            headers::SERVICE_ID,
            headers::NAME,
        ] {
            if let Some(value) = map.get(name) {
                out = out.with(name, value.as_str());
            }
        }
    }
    out
}
