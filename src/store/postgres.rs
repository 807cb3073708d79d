//! PostgreSQL audit store
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE Logs (
//!     id         BIGSERIAL PRIMARY KEY,
//!     user_id    TEXT        NOT NULL,
//!     tx_id      BIGINT      NOT NULL,
//!     event_type TEXT        NOT NULL CHECK (event_type IN ('quote', 'command')),
//!     content    TEXT        NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```

use super::{AuditStore, LogFilter, LogRow, StoreConnection, INSERT_LOG_QUERY};
use crate::error::{AuditError, Result};
use crate::types::LogItem;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Postgres};
use std::str::FromStr;
use std::time::Duration;

const SELECT_ALL_LOGS_QUERY: &str = "SELECT id, user_id, tx_id, event_type, content, created_at \
     FROM Logs WHERE event_type IN ('quote', 'command') \
     ORDER BY created_at ASC, id ASC";

const SELECT_USER_LOGS_QUERY: &str = "SELECT id, user_id, tx_id, event_type, content, created_at \
     FROM Logs WHERE event_type IN ('quote', 'command') AND user_id = $1 \
     ORDER BY created_at ASC, id ASC";

/// Connection settings for the audit database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub sslmode: String,
    pub user: String,
    pub password: String,
    #[serde(rename = "auditdb")]
    pub audit_db: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            sslmode: "disable".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            audit_db: "audit".to_string(),
            max_connections: 32,
            acquire_timeout_secs: 10,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let ssl_mode = PgSslMode::from_str(&self.sslmode)
            .map_err(|e| AuditError::Config(format!("sslmode {:?}: {}", self.sslmode, e)))?;

        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.audit_db)
            .ssl_mode(ssl_mode))
    }
}

/// PostgreSQL store backed by a connection pool
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Build the pool and check the database answers
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| {
                AuditError::Connection(format!(
                    "postgres {}:{}/{}: {}",
                    config.host, config.port, config.audit_db, e
                ))
            })?;

        let store = Self::from_pool(pool);
        store.health_check().await?;

        tracing::info!(
            host = %config.host,
            port = config.port,
            database = %config.audit_db,
            "Connected to audit database"
        );
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PostgresStore {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PostgresConnection {
            conn,
            broken: false,
        }))
    }

    fn name(&self) -> &str {
        "postgres"
    }

    async fn shutdown(&self) {
        self.pool.close().await;
    }
}

/// One task's pooled connection
///
/// sqlx prepares and caches `INSERT_LOG_QUERY` on first use, so repeated
/// inserts reuse the same server-side statement. A connection that failed
/// at the transport level is detached from the pool on close instead of
/// being handed to the next task.
pub struct PostgresConnection {
    conn: PoolConnection<Postgres>,
    broken: bool,
}

#[async_trait]
impl StoreConnection for PostgresConnection {
    async fn insert(&mut self, item: &LogItem) -> Result<()> {
        let result = sqlx::query(INSERT_LOG_QUERY)
            .bind(&item.user_id)
            .bind(item.tx_id)
            .bind(item.log_type.as_str())
            .bind(&item.content)
            .execute(&mut *self.conn)
            .await
            .map_err(AuditError::from);

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.broken |= e.is_connection_lost();
                Err(e)
            }
        }
    }

    fn fetch_logs<'a>(&'a mut self, filter: &'a LogFilter) -> BoxStream<'a, Result<LogRow>> {
        let rows = match filter.user_id.as_deref() {
            Some(user) => sqlx::query_as::<_, LogRow>(SELECT_USER_LOGS_QUERY)
                .bind(user)
                .fetch(&mut *self.conn),
            None => sqlx::query_as::<_, LogRow>(SELECT_ALL_LOGS_QUERY).fetch(&mut *self.conn),
        };
        rows.map(|row| row.map_err(AuditError::from)).boxed()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if self.broken {
            drop(self.conn.detach());
        }
        Ok(())
    }
}
