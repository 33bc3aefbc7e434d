//! Logging configuration and initialization
//!
//! Every Statbucket binary routes its diagnostics through `tracing`. This
//! module installs the global subscriber described by a [`LogConfig`]:
//! console and/or daily-rotated file output, text or JSON lines, and an
//! `EnvFilter` built from the base level plus extra directives.
//!
//! HTML parsing and HTTP crates are chatty at debug level, so their
//! directives default to `warn` unless `RUST_LOG` overrides the whole filter.
//!
//! Library code never prints; use `info!`, `warn!` and friends with
//! structured fields:
//!
//! ```rust
//! use tracing::warn;
//!
//! let dataset = "team_season";
//! warn!(dataset = %dataset, column = "net_rating", "Unexpected column observed");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use statbucket_common::logging::{init_logging, LogConfig, LogLevel};
//!
//! # fn main() -> statbucket_common::Result<()> {
//! let config = LogConfig::for_binary("statbucket-ingest")
//!     .with_level(LogLevel::Debug)
//!     .merge_env()?;
//! let _guard = init_logging(&config)?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::error::{Result, StatbucketError};

/// Dependencies whose debug output drowns out ingestion events
const QUIET_DEPENDENCIES: &[&str] = &["html5ever=warn", "selectors=warn", "hyper=warn", "hyper_util=warn", "sqlx=warn"];

fn parse_choice<T: Copy>(what: &str, input: &str, choices: &[(&str, T)]) -> Result<T> {
    let wanted = input.trim().to_ascii_lowercase();
    choices
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, value)| *value)
        .ok_or_else(|| StatbucketError::Parse(format!("Invalid {}: '{}'", what, input)))
}

/// Minimum level of messages to emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = StatbucketError;

    fn from_str(s: &str) -> Result<Self> {
        parse_choice(
            "log level",
            s,
            &[
                ("trace", LogLevel::Trace),
                ("debug", LogLevel::Debug),
                ("info", LogLevel::Info),
                ("warn", LogLevel::Warn),
                ("warning", LogLevel::Warn),
                ("error", LogLevel::Error),
            ],
        )
    }
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        self != LogOutput::File
    }

    fn file(self) -> bool {
        self != LogOutput::Console
    }
}

impl std::str::FromStr for LogOutput {
    type Err = StatbucketError;

    fn from_str(s: &str) -> Result<Self> {
        parse_choice(
            "log output",
            s,
            &[
                ("console", LogOutput::Console),
                ("stdout", LogOutput::Console),
                ("file", LogOutput::File),
                ("both", LogOutput::Both),
            ],
        )
    }
}

/// Line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = StatbucketError;

    fn from_str(s: &str) -> Result<Self> {
        parse_choice("log format", s, &[("text", LogFormat::Text), ("json", LogFormat::Json)])
    }
}

/// Logging configuration for one binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory for rotated log files
    pub log_dir: PathBuf,
    /// File name prefix, e.g. `statbucket-ingest` -> `statbucket-ingest.2025-03-01`
    pub log_file_prefix: String,
    /// Extra comma separated filter directives, applied after the defaults
    pub filter_directives: Option<String>,
    /// Emit span close events with their busy/idle timings
    pub span_timings: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::for_binary("statbucket")
    }
}

impl LogConfig {
    /// Console text logging at `info`, files named after `binary`
    pub fn for_binary(binary: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: binary.into(),
            filter_directives: None,
            span_timings: false,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_filter(mut self, directives: impl Into<String>) -> Self {
        self.filter_directives = Some(directives.into());
        self
    }

    pub fn with_span_timings(mut self, enabled: bool) -> Self {
        self.span_timings = enabled;
        self
    }

    /// Overlay `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`,
    /// `LOG_FILTER` and `LOG_SPAN_TIMINGS` where set
    pub fn merge_env(mut self) -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        if let Some(level) = var("LOG_LEVEL") {
            self.level = level.parse()?;
        }
        if let Some(output) = var("LOG_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Some(dir) = var("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(filter) = var("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        if let Some(timings) = var("LOG_SPAN_TIMINGS") {
            self.span_timings = matches!(timings.trim(), "1" | "true" | "yes");
        }
        Ok(self)
    }

    /// Full directive string: level, quiet dependencies, then extras
    pub fn directives(&self) -> String {
        let mut parts = vec![self.level.directive()];
        parts.extend_from_slice(QUIET_DEPENDENCIES);
        if let Some(extra) = &self.filter_directives {
            parts.extend(extra.split(',').map(str::trim).filter(|d| !d.is_empty()));
        }
        parts.join(",")
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(self.directives())
            .map_err(|e| StatbucketError::Config(format!("Invalid log filter '{}': {}", self.directives(), e)))
    }
}

/// Keeps the background file writer alive; dropping it flushes pending lines
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let spans = if config.span_timings { FmtSpan::CLOSE } else { FmtSpan::NONE };
    let layer = fmt::layer().with_writer(writer).with_ansi(ansi).with_span_events(spans);
    match config.format {
        LogFormat::Text => layer.with_target(false).boxed(),
        LogFormat::Json => layer.json().with_current_span(true).boxed(),
    }
}

/// Install the global subscriber. Call once at startup and hold the guard.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let filter = config.env_filter()?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut file_guard = None;

    if config.output.console() {
        layers.push(fmt_layer(config, std::io::stderr, true));
    }
    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        layers.push(fmt_layer(config, writer, false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| StatbucketError::Config(format!("Failed to install tracing subscriber: {}", e)))?;

    Ok(LogGuard { _file: file_guard })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choices() {
        assert_eq!(" WARNING ".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("both".parse::<LogOutput>().unwrap(), LogOutput::Both);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        let err = "syslog".parse::<LogOutput>().unwrap_err();
        assert_eq!(err.to_string(), "Parse error: Invalid log output: 'syslog'");
    }

    #[test]
    fn test_directives_quiet_parsers_and_append_extras() {
        let config = LogConfig::for_binary("statbucket-ingest")
            .with_level(LogLevel::Debug)
            .with_filter("statbucket_ingest::migration=trace, ");
        let directives = config.directives();
        assert!(directives.starts_with("debug,html5ever=warn"));
        assert!(directives.ends_with("sqlx=warn,statbucket_ingest::migration=trace"));
    }

    #[test]
    fn test_outputs() {
        assert!(LogOutput::Both.console() && LogOutput::Both.file());
        assert!(!LogOutput::Console.file());
        assert!(!LogOutput::File.console());
    }
}
