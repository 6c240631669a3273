mod warn_log;

pub use warn_log::{WarnLogLayer, WarnLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "scanlink_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            log_to_sqlite: false,
            log_db_path: default_data_dir().join("scanlink-logs.db"),
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string, e.g. `"info,scanlink_store=debug"`.
    pub fn filter_directive(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Returned by [`init_telemetry`]; reports where warnings are persisted.
pub struct TelemetryGuard {
    warn_log_path: Option<PathBuf>,
}

impl TelemetryGuard {
    /// Path of the warning database, if the SQLite layer was installed.
    pub fn warn_log_path(&self) -> Option<&std::path::Path> {
        self.warn_log_path.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let warn_layer = if config.log_to_sqlite {
        match WarnLogSink::open(&config.log_db_path) {
            Ok(sink) => Some(WarnLogLayer::new(Arc::new(sink))),
            Err(e) => {
                eprintln!("scanlink-telemetry: failed to open log DB: {e}");
                None
            }
        }
    } else {
        None
    };
    let warn_log_path = warn_layer.as_ref().map(|_| config.log_db_path.clone());

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(warn_layer)
        .init();

    TelemetryGuard { warn_log_path }
}

/// Default directory for scanlink data files.
pub fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".scanlink")
}
