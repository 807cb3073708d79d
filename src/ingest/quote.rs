//! Quote broadcast feed
//!
//! Every fresh quote is turned into a `quote` audit event whose content is
//! the `<quoteServer>` fragment, stamped with the time it was logged and
//! the `serviceID` of the quote server that produced it.

use super::DeliveryHandler;
use crate::buffer::BufferConnection;
use crate::error::Result;
use crate::provider::Delivery;
use crate::types::{now_millis, Quote};
use async_trait::async_trait;

/// Buffers intercepted quotes
pub struct QuoteHandler {
    buffer: Box<dyn BufferConnection>,
    key: String,
}

impl QuoteHandler {
    pub fn new(buffer: Box<dyn BufferConnection>, key: impl Into<String>) -> Self {
        Self {
            buffer,
            key: key.into(),
        }
    }
}

#[async_trait]
impl DeliveryHandler for QuoteHandler {
    fn kind(&self) -> &'static str {
        "quote"
    }

    async fn handle(&mut self, delivery: &Delivery) -> Result<()> {
        let quote = Quote::parse(delivery.text()?)?;
        let server = delivery.headers.service_id();

        tracing::debug!(
            tx_id = quote.transaction_id,
            stock = %quote.stock,
            server,
            "Intercepted quote"
        );

        let event = quote.into_audit_event(server, now_millis())?;
        self.buffer.push(&self.key, &event.encode()).await
    }
}
