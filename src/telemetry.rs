//! Logging setup.
//!
//! Console output goes to stderr (plain or JSON). When enabled, a second JSON
//! layer writes to a daily rolling file under `.marshal/logs/` so a run can be
//! audited after the terminal is gone. The filter comes from `RUST_LOG`, then
//! `MARSHAL_LOG`, then the configured level.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::marshal_config::{LogFormat, LoggingSection};

/// Prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "marshal.log";

/// Resolve the filter directive.
pub fn filter_directive(logging: &LoggingSection, verbose: bool) -> String {
    if let Ok(value) = std::env::var("RUST_LOG")
        && !value.trim().is_empty()
    {
        return value;
    }
    if let Ok(value) = std::env::var("MARSHAL_LOG")
        && !value.trim().is_empty()
    {
        return value;
    }
    if verbose {
        "marshal=debug,info".to_string()
    } else {
        logging.level.clone()
    }
}

/// Install the global subscriber.
///
/// Returns the file writer's guard when file logging is on; keep it alive
/// until exit so buffered lines are flushed.
pub fn init_logging(
    logging: &LoggingSection,
    log_dir: Option<&Path>,
    verbose: bool,
) -> Result<Option<WorkerGuard>> {
    let directive = filter_directive(logging, verbose);
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter '{}'", directive))?;

    let console_layer = match logging.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Plain => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file_layer, guard) = match log_dir.filter(|_| logging.file) {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log dir: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
