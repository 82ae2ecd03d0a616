//! `tracing` subscriber setup for hosts embedding the offline layer.
//!
//! Hosts either build a [`LogConfig`] by hand or take one from the
//! environment with [`LogConfig::from_env`]:
//!
//! - `C3_LOG`: an `EnvFilter` directive string, e.g. `c3_sw=debug`
//! - `C3_LOG_FORMAT`: `pretty`, `compact` or `json`

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::C3Error;

/// Filter directive environment variable.
pub const LOG_FILTER_ENV: &str = "C3_LOG";
/// Format environment variable.
pub const LOG_FORMAT_ENV: &str = "C3_LOG_FORMAT";

/// HTTP stack targets that are noisy below `warn`.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable.
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = C3Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(C3Error::InvalidArgument(format!(
                "unknown log format: {other}"
            ))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for crates not named in `filter`.
    pub level: Level,
    pub format: LogFormat,
    /// Include source file and line (pretty format only).
    pub include_location: bool,
    /// Log span enter/close.
    pub include_span_events: bool,
    /// Extra `EnvFilter` directives, e.g. `c3_sw=trace`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Read `C3_LOG` and `C3_LOG_FORMAT`, falling back to the defaults.
    pub fn from_env() -> Result<Self, C3Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, C3Error> {
        let mut config = Self::default();
        if let Some(format) = lookup(LOG_FORMAT_ENV) {
            config.format = format.parse()?;
        }
        if let Some(filter) = lookup(LOG_FILTER_ENV).filter(|f| !f.trim().is_empty()) {
            config.filter = Some(filter);
        }
        Ok(config)
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Full directive string: base level, quieted HTTP targets, then the
    /// caller's directives, which win on conflict.
    pub fn directives(&self) -> String {
        let mut directives = vec![self.level.to_string().to_lowercase()];
        directives.extend(QUIET_TARGETS.iter().map(|t| format!("{t}=warn")));
        if let Some(extra) = &self.filter {
            directives.push(extra.clone());
        }
        directives.join(",")
    }

    fn env_filter(&self) -> Result<EnvFilter, C3Error> {
        EnvFilter::try_new(self.directives())
            .map_err(|e| C3Error::config_with_source("invalid log filter", e))
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.include_span_events {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        match self.format {
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_file(self.include_location)
                .with_line_number(self.include_location)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_target(true)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_events(span_events)
                .boxed(),
        }
    }
}

/// Install the global subscriber.
///
/// Fails on a bad filter or if a global subscriber is already installed.
pub fn init_logging(config: LogConfig) -> Result<(), C3Error> {
    let filter = config.env_filter()?;

    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(filter)
        .try_init()
        .map_err(|e| C3Error::internal(format!("logging already initialized: {e}")))
}
