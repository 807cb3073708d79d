//! Error types for a3s-audit

use thiserror::Error;

/// Errors that can occur in the audit pipeline
#[derive(Debug, Error)]
pub enum AuditError {
    /// Backend connection failure (broker, buffer or store)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Source (queue/exchange) declaration failure
    #[error("Failed to declare source '{source_name}': {reason}")]
    Declare {
        source_name: String,
        reason: String,
    },

    /// Subscribe failure
    #[error("Failed to subscribe to '{source_name}': {reason}")]
    Subscribe {
        source_name: String,
        reason: String,
    },

    /// Publish failure
    #[error("Failed to publish to '{route}': {reason}")]
    Publish {
        route: String,
        reason: String,
    },

    /// Error while receiving from an open subscription
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Durable buffer failure (push, pop, length)
    #[error("Buffer error: {0}")]
    Buffer(String),

    /// Relational store failure (insert, query, row scan)
    #[error("Store error: {0}")]
    Store(String),

    /// The store connection is gone; a fresh one is needed
    #[error("Store connection lost: {0}")]
    StoreUnavailable(String),

    /// A payload or buffered record could not be parsed
    #[error("Failed to parse {kind}: {reason}")]
    Parse {
        kind: &'static str,
        reason: String,
    },

    /// A required message header is absent
    #[error("Missing header '{0}'")]
    MissingHeader(&'static str),

    /// A message header is present but has the wrong shape
    #[error("Invalid header '{name}': {value:?}")]
    InvalidHeader {
        name: &'static str,
        value: String,
    },

    /// Output document I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuditError {
    /// Build a parse error for the given record kind
    pub fn parse(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::Parse {
            kind,
            reason: reason.into(),
        }
    }

    /// Whether the error only affects the item being processed
    ///
    /// Per-item errors are logged and skipped; everything else ends the
    /// task that hit it.
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. } | Self::MissingHeader(_) | Self::InvalidHeader { .. }
        )
    }

    /// Whether the store connection that produced this error is unusable
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<sqlx::Error> for AuditError {
    fn from(e: sqlx::Error) -> Self {
        if connection_lost(&e) {
            Self::StoreUnavailable(e.to_string())
        } else {
            Self::Store(e.to_string())
        }
    }
}

/// Transport failures, pool exhaustion, and server-side session kills
/// (SQLSTATE class 08, 57P01..57P03)
fn connection_lost(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            let code: &str = &code;
            code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
        }),
        _ => false,
    }
}

impl From<redis::RedisError> for AuditError {
    fn from(e: redis::RedisError) -> Self {
        Self::Buffer(e.to_string())
    }
}

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;
