//! Tracing initialization.
//!
//! Structured, async-aware logging via `tracing` and `tracing-subscriber`.
//! The level and format come from [`MonitorConfig`]; `RUST_LOG` overrides
//! the configured level when set. Initialization is idempotent so tests
//! and embedding applications can call it freely.

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::config::MonitorConfig;

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-oriented multi-line output with colors.
    Pretty,
    /// Single-line output without colors.
    Compact,
    /// JSON lines for log aggregation.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!(
                "invalid log format '{other}'; must be pretty, compact, or json"
            )),
        }
    }
}

/// Initialize tracing from the monitor configuration.
pub fn init_from_config(config: &MonitorConfig) -> Result<(), String> {
    let level = parse_log_level(&config.log_level)?;
    let format: OutputFormat = config.log_format.parse()?;
    init(level, format)
}

/// Initialize tracing with explicit settings. Safe to call more than once.
pub fn init(level: Level, format: OutputFormat) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let result = match format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer().pretty().with_filter(env_filter))
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(fmt::layer().compact().with_ansi(false).with_filter(env_filter))
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_filter(env_filter))
            .try_init(),
    };

    result.or_else(|err| {
        // A second init (tests, embedding hosts) is not an error.
        if err
            .to_string()
            .contains("a global default trace dispatcher has already been set")
        {
            Ok(())
        } else {
            Err(format!("failed to initialize tracing: {err}"))
        }
    })
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(format!(
            "invalid log level '{other}'; must be one of: trace, debug, info, warn, error"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert!(matches!(parse_log_level("info"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("DEBUG"), Ok(Level::DEBUG)));
        assert!(matches!(parse_log_level("Warn"), Ok(Level::WARN)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn parses_formats() {
        assert_eq!("pretty".parse::<OutputFormat>(), Ok(OutputFormat::Pretty));
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn double_init_is_tolerated() {
        assert!(init(Level::WARN, OutputFormat::Compact).is_ok());
        assert!(init(Level::INFO, OutputFormat::Compact).is_ok());
    }
}
