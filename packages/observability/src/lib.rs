//! # Observability
//!
//! Logging setup for the proxy client binaries.
//!
//! Libraries in this workspace only emit `tracing` events; binaries call
//! [`init`] or [`init_with_config`] once at startup to decide where those
//! events go:
//!
//! - compact human-readable lines on stderr (default)
//! - structured JSONL appended to a file, for `tail -f ... | jq`
//!
//! `RUST_LOG` always overrides the configured level.
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "libp2p-proxy".into(),
//!         default_level: "debug".into(),
//!         ..Default::default()
//!     });
//!     tracing::info!("ready");
//! }
//! ```

mod file;

pub use file::{default_log_path, AppendWriter};

use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the binary, attached to the startup event.
    pub service_name: String,

    /// Default level filter (e.g., "debug", "info").
    /// Overridden by `RUST_LOG`.
    pub default_level: String,

    /// Write JSONL to this file instead of stderr.
    pub log_path: Option<PathBuf>,

    /// With `log_path` set, also print compact lines to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Initialize logging with default settings.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize logging.
///
/// Falls back to stderr if the log file cannot be opened. Calling this twice
/// leaves the first subscriber in place.
pub fn init_with_config(config: LogConfig) {
    let file_writer = match &config.log_path {
        Some(path) => match AppendWriter::open(path) {
            Ok(writer) => Some(writer),
            Err(e) => {
                eprintln!("failed to open log file {}: {}", path.display(), e);
                None
            }
        },
        None => None,
    };

    let stderr_enabled = file_writer.is_none() || config.also_stderr;

    let json_layer = file_writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_writer(writer)
            .with_filter(env_filter(&config.default_level))
    });

    let stderr_layer = stderr_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter(&config.default_level))
    });

    let installed = tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(
            service = %config.service_name,
            pid = std::process::id(),
            log_path = ?config.log_path,
            "observability initialized"
        );
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};
