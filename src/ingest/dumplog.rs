//! Dumplog request feed
//!
//! Requests are exported inline by the consuming task. A failed export is
//! logged and counted as rejected; it never stops the feed.

use super::DeliveryHandler;
use crate::error::{AuditError, Result};
use crate::export::ExportEngine;
use crate::provider::Delivery;
use crate::types::DumplogRequest;
use async_trait::async_trait;

/// Runs an export for every dump request
pub struct DumplogHandler {
    engine: ExportEngine,
}

impl DumplogHandler {
    pub fn new(engine: ExportEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl DeliveryHandler for DumplogHandler {
    fn kind(&self) -> &'static str {
        "dumplog"
    }

    async fn handle(&mut self, delivery: &Delivery) -> Result<()> {
        let request = DumplogRequest::parse(delivery.text()?, &delivery.headers)?;

        if request.is_admin() {
            tracing::warn!(filename = %request.filename, "Admin dump triggered");
        } else {
            tracing::info!(user_id = %request.user_id, filename = %request.filename, "Dump triggered");
        }

        self.engine.export(&request).await.map(|_| ())
    }

    fn is_fatal(&self, _error: &AuditError) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{MessageHeaders, USER_ID};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn handler(dir: &std::path::Path, store: MemoryStore) -> DumplogHandler {
        DumplogHandler::new(ExportEngine::new(Arc::new(store), dir))
    }

    #[tokio::test]
    async fn test_request_writes_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = handler(dir.path(), MemoryStore::new());

        handler
            .handle(&Delivery::new("u1,mine", MessageHeaders::new()))
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("u1_") && names[0].ends_with("_mine.xml"));
    }

    #[tokio::test]
    async fn test_user_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = handler(dir.path(), MemoryStore::new());

        let headers = MessageHeaders::new().with(USER_ID, "admin");
        handler.handle(&Delivery::new("", headers)).await.unwrap();

        let entry = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        assert!(!name.contains('_'), "system-level name expected, got {}", name);
    }

    #[tokio::test]
    async fn test_export_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let mut handler = handler(dir.path(), store);

        let err = handler
            .handle(&Delivery::new("u1,x", MessageHeaders::new()))
            .await
            .unwrap_err();
        assert!(!handler.is_fatal(&err));
    }

    #[tokio::test]
    async fn test_request_without_user_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = handler(dir.path(), MemoryStore::new());

        let err = handler
            .handle(&Delivery::new("", MessageHeaders::new()))
            .await
            .unwrap_err();
        assert!(err.is_per_item());
    }
}
