//! a3s-audit - audit logger service
//!
//! Connects to NATS, Redis and PostgreSQL, then runs the ingestion and
//! persistence pipeline until interrupted.

use a3s_audit::buffer::RedisBuffer;
use a3s_audit::export::ensure_output_dir;
use a3s_audit::provider::nats::NatsProvider;
use a3s_audit::store::PostgresStore;
use a3s_audit::{AuditConfig, AuditContext, AuditService, AuditStore, Shutdown};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Console log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
enum LogLevel {
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Critical | LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Notice | LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Parser)]
#[command(name = "a3s-audit")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Store records for safe keeping")]
struct Cli {
    /// Minimum level for logging to the console
    #[arg(short, long, value_enum, ignore_case = true, default_value = "WARNING")]
    log_level: LogLevel,

    /// Logging name for the service
    #[arg(short, long, default_value = "audit")]
    service_id: String,

    /// TOML file with service config
    #[arg(short, long, env = "A3S_AUDIT_CONFIG", default_value = "./config/dev.toml")]
    config: PathBuf,

    /// Directory that will hold audit logs
    #[arg(short = 'd', long, default_value = "logs")]
    log_directory: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.directive().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let span = tracing::info_span!("service", id = %cli.service_id);
    run(cli).instrument(span).await
}

async fn run(cli: Cli) -> Result<()> {
    let config = AuditConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    ensure_output_dir(&cli.log_directory).with_context(|| {
        format!(
            "Couldn't create log directory {}",
            cli.log_directory.display()
        )
    })?;

    let broker = NatsProvider::connect(config.broker.clone())
        .await
        .context("Failed to connect to NATS")?;
    let buffer = RedisBuffer::connect(&config.redis)
        .await
        .context("Failed to connect to Redis")?;
    let store = Arc::new(
        PostgresStore::connect(&config.database)
            .await
            .context("Failed to connect to the audit database")?,
    );

    let ctx = Arc::new(AuditContext::new(
        Arc::new(broker),
        Arc::new(buffer),
        store.clone(),
        config.pipeline_settings(&cli.log_directory),
    ));

    let handle = AuditService::start(ctx)
        .await
        .context("Failed to start audit service")?;
    tokio::spawn(trigger_on_signal(handle.shutdown_signal()));

    let report = handle.wait().await;
    store.shutdown().await;

    if !report.is_clean() {
        anyhow::bail!(
            "{} task(s) failed: {}",
            report.failures.len(),
            report.failures.join("; ")
        );
    }
    Ok(())
}

async fn trigger_on_signal(shutdown: Shutdown) {
    tokio::select! {
        _ = shutdown.wait() => return,
        _ = interrupted() => {}
    }
    tracing::warn!("Shutdown requested");
    shutdown.trigger();
}

#[cfg(unix)]
async fn interrupted() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn interrupted() {
    let _ = tokio::signal::ctrl_c().await;
}
