//! Logging setup for the `fleetrun` binary.
//!
//! Two output modes:
//! - Development: pretty-printed human-readable logs
//! - Cluster: JSON lines for log aggregation
//!
//! Set `FLEETRUN_LOG_FORMAT=json` for JSON logs.
//! Set `RUST_LOG` to control log levels (default: info).
//!
//! Launcher logs go to stderr. Stdout carries the forwarded output of the
//! first local trainer.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub const LOG_FORMAT_VAR: &str = "FLEETRUN_LOG_FORMAT";

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Detect log format from environment.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_VAR).unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Filter for `level`, falling back to `RUST_LOG` and then `info`.
fn env_filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(lvl) => EnvFilter::try_new(lvl).unwrap_or_else(|e| {
            eprintln!("invalid log level {lvl:?} ({e}), using info");
            EnvFilter::new("info")
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Initialize logging with the format from `FLEETRUN_LOG_FORMAT`.
///
/// `level` overrides `RUST_LOG` when provided (e.g. `"debug"`, `"warn"`).
pub fn init_with_level(level: Option<&str>) -> anyhow::Result<()> {
    init_with_level_and_format(level, LogFormat::from_env())
}

pub fn init_with_level_and_format(level: Option<&str>, format: LogFormat) -> anyhow::Result<()> {
    let env_filter = env_filter(level);

    let fmt_layer = match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging subscriber init failed: {e}"))
}
