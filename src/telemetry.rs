use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable overriding the configured log level with a full filter directive.
pub const LOG_ENV: &str = "HTTPE_LOG";

/// Installs the global subscriber. With `log_file` set, logs are appended there
/// instead of going to stdout.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_new(std::env::var(LOG_ENV).unwrap_or_else(|_| level.into()))
        .with_context(|| format!("invalid log level '{}'", level))?;

    let (file_layer, stdout_layer) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("error opening log file '{}'", path.display()))?;
            (Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))), None)
        }
        None => (None, Some(fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .context("error installing the logger")?;
    Ok(())
}
