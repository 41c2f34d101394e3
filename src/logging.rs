//! Logging Setup
//!
//! Installs the global `tracing` subscriber from the `[logging]` section of
//! the configuration. `RUST_LOG` always wins over the configured level, and
//! `--verbose` raises the configured level to debug.
//!
//! Logs go to stderr (or the configured file) so stdout stays reserved for
//! command output.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

/// Initialize the global subscriber
///
/// # Errors
///
/// Returns an error if the log file cannot be opened, the format is unknown,
/// or a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let format: LogFormat = config.format.parse().map_err(anyhow::Error::msg)?;
    let filter = build_filter(&config.level, verbose);
    let (writer, ansi) = make_writer(config)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(format_layer(format, writer, ansi))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(level = %config.level, format = ?format, verbose, "Logging initialized");
    Ok(())
}

/// Directive used when `RUST_LOG` is unset
pub fn filter_directive(level: &str, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        level.to_lowercase()
    }
}

fn build_filter(level: &str, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level, verbose)))
}

fn make_writer(config: &LoggingConfig) -> Result<(BoxMakeWriter, bool)> {
    match (&config.log_file, config.log_to_file) {
        (Some(path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            Ok((BoxMakeWriter::new(Mutex::new(file)), false))
        }
        _ => Ok((BoxMakeWriter::new(std::io::stderr), true)),
    }
}

fn format_layer<S>(format: LogFormat, writer: BoxMakeWriter, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true);

    match format {
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use tracing::{debug, info};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
        }

        fn writer(&self) -> BoxMakeWriter {
            let sink = self.clone();
            BoxMakeWriter::new(move || sink.clone())
        }
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default(), LogFormat::Compact);
    }

    #[test]
    fn test_verbose_raises_level() {
        assert_eq!(filter_directive("WARN", false), "warn");
        assert_eq!(filter_directive("warn", true), "debug");
    }

    #[test]
    fn test_json_output_is_structured() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("info"))
            .with(format_layer(LogFormat::Json, captured.writer(), false));

        tracing::subscriber::with_default(subscriber, || {
            info!(server = "files", id = 7u64, "Request sent");
            debug!("filtered out");
        });

        let lines: Vec<serde_json::Value> = captured
            .text()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["level"], "INFO");
        assert_eq!(lines[0]["fields"]["message"], "Request sent");
        assert_eq!(lines[0]["fields"]["server"], "files");
        assert_eq!(lines[0]["fields"]["id"], 7);
    }

    #[test]
    fn test_compact_output_is_readable() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("debug"))
            .with(format_layer(LogFormat::Compact, captured.writer(), false));

        tracing::subscriber::with_default(subscriber, || {
            debug!(method = "tools/list", "Frame received");
        });

        let text = captured.text();
        assert!(text.contains("DEBUG"));
        assert!(text.contains("Frame received"));
        assert!(text.contains("method=\"tools/list\""));
    }

    #[test]
    fn test_log_file_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolwire.log");
        let config = LoggingConfig {
            log_to_file: true,
            log_file: Some(path.to_string_lossy().to_string()),
            ..Default::default()
        };

        let (writer, ansi) = make_writer(&config).unwrap();
        assert!(!ansi);
        assert!(path.exists());

        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("info"))
            .with(format_layer(LogFormat::Compact, writer, ansi));
        tracing::subscriber::with_default(subscriber, || info!("written to file"));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("written to file"));
    }

    #[test]
    fn test_log_file_unopenable() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            log_to_file: true,
            log_file: Some(dir.path().join("missing/dir/x.log").to_string_lossy().to_string()),
            ..Default::default()
        };
        assert!(make_writer(&config).is_err());
    }
}
