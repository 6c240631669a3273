//! # scanlink
//!
//! Session-pairing relay binary: loads config, opens the session store and
//! serves the websocket and REST endpoints until ctrl+c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use scanlink_server::config::{self, RelayConfig};
use scanlink_store::{Database, SqliteSessionStore};
use scanlink_telemetry::{init_telemetry, TelemetryConfig};

/// ScanLink relay server.
#[derive(Parser, Debug)]
#[command(name = "scanlink", about = "QR scan session-pairing relay")]
struct Cli {
    /// Path to a JSON config file (default `~/.scanlink/config.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` session database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(self, config: &mut RelayConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = self.db_path {
            config.database_path = path;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

fn telemetry_config(config: &RelayConfig) -> TelemetryConfig {
    let defaults = TelemetryConfig::default();
    TelemetryConfig {
        log_level: config::parse_level(&config.logging.level).unwrap_or(defaults.log_level),
        json: config.logging.json,
        log_to_sqlite: config.logging.persist_warnings,
        log_db_path: config
            .logging
            .db_path
            .clone()
            .unwrap_or(defaults.log_db_path),
        ..defaults
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(cli.config.as_deref()).context("Failed to load config")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let telemetry = init_telemetry(&telemetry_config(&config));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting ScanLink relay");
    if let Some(path) = telemetry.warn_log_path() {
        tracing::info!(path = %path.display(), "Persisting warnings to SQLite");
    }

    let db = Database::open(&config.database_path)
        .with_context(|| format!("Failed to open database: {}", config.database_path.display()))?;
    let store = SqliteSessionStore::with_ttl(db, config.session_ttl());

    let handle = scanlink_server::start(&config, Arc::new(store))
        .await
        .context("Failed to start server")?;

    tracing::info!(port = handle.port, "ScanLink relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown();
    Ok(())
}
