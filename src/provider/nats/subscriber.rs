//! NATS pull-consumer subscription

use super::client::message_headers;
use crate::error::{AuditError, Result};
use crate::provider::{Delivery, Subscription};
use async_nats::jetstream::consumer::pull;
use async_trait::async_trait;
use futures::StreamExt;

/// Subscription backed by a JetStream pull consumer message stream
pub struct NatsSubscription {
    messages: pull::Stream,
    source: String,
}

impl NatsSubscription {
    pub(crate) fn new(messages: pull::Stream, source: String) -> Self {
        Self { messages, source }
    }

    /// Source this subscription reads from
    pub fn source(&self) -> &str {
        &self.source
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        match self.messages.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(AuditError::Delivery(format!("{}: {}", self.source, e))),
            Some(Ok(msg)) => Ok(Some(Delivery::new(
                msg.payload.clone(),
                message_headers(msg.headers.as_ref()),
            ))),
        }
    }
}
