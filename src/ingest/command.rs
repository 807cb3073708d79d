//! Command/audit feed
//!
//! Producers publish pre-rendered audit events in buffer encoding. Each one
//! is validated and appended to the pending-events worklist. The payload's
//! transaction number is authoritative; a `transactionID` header that
//! disagrees with it is only reported.

use super::DeliveryHandler;
use crate::buffer::BufferConnection;
use crate::error::{AuditError, Result};
use crate::headers::MessageHeaders;
use crate::provider::Delivery;
use crate::types::AuditEvent;
use async_trait::async_trait;

/// Buffers command feed deliveries
pub struct CommandHandler {
    buffer: Box<dyn BufferConnection>,
    key: String,
}

impl CommandHandler {
    pub fn new(buffer: Box<dyn BufferConnection>, key: impl Into<String>) -> Self {
        Self {
            buffer,
            key: key.into(),
        }
    }
}

#[async_trait]
impl DeliveryHandler for CommandHandler {
    fn kind(&self) -> &'static str {
        "command"
    }

    async fn handle(&mut self, delivery: &Delivery) -> Result<()> {
        let event = AuditEvent::decode(delivery.text()?.trim())?;
        let header_tx = header_transaction(&delivery.headers);

        tracing::debug!(
            user_id = %event.user_id,
            tx_id = event.transaction_id,
            header_tx_id = ?header_tx,
            command = delivery.headers.name().unwrap_or_default(),
            "Audit event received"
        );
        if let Some(header_tx) = header_tx.filter(|&tx| tx != event.transaction_id) {
            tracing::warn!(
                user_id = %event.user_id,
                tx_id = event.transaction_id,
                header_tx_id = header_tx,
                "transactionID header disagrees with payload"
            );
        }

        self.buffer.push(&self.key, &event.encode()).await
    }
}

/// The `transactionID` header, if present and numeric
fn header_transaction(headers: &MessageHeaders) -> Option<i64> {
    match headers.transaction_id() {
        Ok(tx) => Some(tx),
        Err(AuditError::MissingHeader(_)) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring transactionID header");
            None
        }
    }
}
