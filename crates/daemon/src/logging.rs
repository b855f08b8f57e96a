// Logging setup: EnvFilter + pretty/JSON stdout + optional rolling file

use crate::config::{LogFormat, LoggingConfig};
use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

const DEFAULT_FILTER: &str = "fhir_export=info";
const LOG_FORMAT_ENV: &str = "FHIR_EXPORT_LOG_FORMAT";
const LOG_FILE_PREFIX: &str = "fhir-export.log";

/// Format from `FHIR_EXPORT_LOG_FORMAT`, falling back to the config
fn resolve_format(config: &LoggingConfig) -> LogFormat {
    match std::env::var(LOG_FORMAT_ENV).ok().as_deref() {
        Some("json") => LogFormat::Json,
        Some("pretty") => LogFormat::Pretty,
        _ => config.format,
    }
}

/// Install the global subscriber
///
/// The returned guard flushes the file writer and must live until exit.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match resolve_format(config) {
        // Production: JSON structured logging
        LogFormat::Json => fmt::layer().json().boxed(),
        // Development: pretty formatting with colors
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
    });

    let guard = match &config.directory {
        Some(directory) => {
            let directory = shellexpand::tilde(directory).into_owned();
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn test_config_format_used_without_override() {
        if std::env::var(LOG_FORMAT_ENV).is_ok() {
            return;
        }
        let config = LoggingConfig {
            format: LogFormat::Json,
            directory: None,
        };
        assert_eq!(resolve_format(&config), LogFormat::Json);
    }
}
