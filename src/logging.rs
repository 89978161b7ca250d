//! Tracing subscriber setup shared by the binaries

use crate::config::LoggingConfig;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::fmt::{MakeWriter, SubscriberBuilder};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `level_override` (from the command line) replaces the configured
/// filter. Output goes to stdout unless a log file is configured.
pub fn init(config: &LoggingConfig, level_override: Option<&str>) -> crate::Result<()> {
    let level = level_override.unwrap_or(&config.level);
    let filter = EnvFilter::try_new(level)
        .map_err(|e| crate::Error::Config(format!("Invalid log level '{}': {}", level, e)))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    crate::Error::Config(format!("Failed to open log file {}: {}", path, e))
                })?;
            install(
                builder.with_writer(Mutex::new(file)).with_ansi(false),
                &config.format,
            )
        }
        None => install(builder, &config.format),
    }
}

fn install<W>(
    builder: SubscriberBuilder<DefaultFields, Format, EnvFilter, W>,
    format: &str,
) -> crate::Result<()>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let result = match format {
        "pretty" => builder.pretty().try_init(),
        "compact" => builder.compact().try_init(),
        "json" => builder.json().try_init(),
        other => {
            return Err(crate::Error::Config(format!(
                "Unknown log format '{}' (expected pretty, compact or json)",
                other
            )))
        }
    };
    result.map_err(|e| crate::Error::Config(format!("Failed to install logger: {}", e)))
}
