//! Typed access to broker message headers
//!
//! Producers attach `transactionID`, `userID`, `serviceID` and `name`
//! headers. Brokers deliver them as strings; the accessors here parse and
//! validate them so a missing or mistyped header becomes a per-item error
//! instead of a crash.

use crate::error::{AuditError, Result};
use std::collections::HashMap;

/// Header carrying the upstream transaction number
pub const TRANSACTION_ID: &str = "transactionID";
/// Header carrying the originating user
pub const USER_ID: &str = "userID";
/// Header carrying the originating service
pub const SERVICE_ID: &str = "serviceID";
/// Diagnostic message name
pub const NAME: &str = "name";

/// Server id recorded when the producer did not identify itself
pub const UNKNOWN_SERVICE: &str = "UNKNOWN";

/// Headers attached to a delivered message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    values: HashMap<String, String>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Add a header
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Raw header value
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `transactionID` as an integer
    pub fn transaction_id(&self) -> Result<i64> {
        let raw = self
            .get(TRANSACTION_ID)
            .ok_or(AuditError::MissingHeader(TRANSACTION_ID))?;
        raw.trim()
            .parse::<i64>()
            .map_err(|_| AuditError::InvalidHeader {
                name: TRANSACTION_ID,
                value: raw.to_string(),
            })
    }

    /// `userID`, which must be non-empty
    pub fn user_id(&self) -> Result<&str> {
        match self.get(USER_ID).map(str::trim) {
            Some(user) if !user.is_empty() => Ok(user),
            _ => Err(AuditError::MissingHeader(USER_ID)),
        }
    }

    /// `serviceID`, or `UNKNOWN` when absent or empty
    pub fn service_id(&self) -> &str {
        match self.get(SERVICE_ID).map(str::trim) {
            Some(service) if !service.is_empty() => service,
            _ => UNKNOWN_SERVICE,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.get(NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let headers = MessageHeaders::new()
            .with(TRANSACTION_ID, "42")
            .with(USER_ID, "u1")
            .with(SERVICE_ID, "QS2")
            .with(NAME, "BUY");

        assert_eq!(headers.transaction_id().unwrap(), 42);
        assert_eq!(headers.user_id().unwrap(), "u1");
        assert_eq!(headers.service_id(), "QS2");
        assert_eq!(headers.name(), Some("BUY"));
    }

    #[test]
    fn test_missing_and_mistyped() {
        let headers = MessageHeaders::new().with(TRANSACTION_ID, "forty-two");

        assert!(matches!(
            headers.transaction_id(),
            Err(AuditError::InvalidHeader { name: TRANSACTION_ID, .. })
        ));
        assert!(matches!(
            headers.user_id(),
            Err(AuditError::MissingHeader(USER_ID))
        ));
        assert!(matches!(
            MessageHeaders::new().transaction_id(),
            Err(AuditError::MissingHeader(TRANSACTION_ID))
        ));
    }

    #[test]
    fn test_service_id_default() {
        assert_eq!(MessageHeaders::new().service_id(), UNKNOWN_SERVICE);
        let blank = MessageHeaders::new().with(SERVICE_ID, "  ");
        assert_eq!(blank.service_id(), UNKNOWN_SERVICE);
    }

    #[test]
    fn test_empty_user_is_missing() {
        let headers = MessageHeaders::new().with(USER_ID, "");
        assert!(headers.user_id().is_err());
    }
}
