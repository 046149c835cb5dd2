//! Logging initialization and configuration

use crate::error::{TeeError, TeeResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Target of lines a script writes through `env.log`
pub(crate) const SCRIPT_LOG_TARGET: &str = "neo_enclave::script";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, text, compact)
    pub format: LogFormat,

    /// Enable ANSI colors (ignored for json)
    pub color: bool,

    /// Include target in log output
    pub include_target: bool,

    /// Include file location in log output
    pub include_location: bool,

    /// Emit span open/close events
    pub span_events: bool,

    /// Mirror script `env.log` lines into the enclave log. Scripts are
    /// untrusted, so this is off unless asked for.
    pub script_logs: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// Compact single-line format
    Compact,
    /// JSON format for machine parsing
    Json,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            color: true,
            include_target: true,
            include_location: false,
            span_events: false,
            script_logs: false,
        }
    }
}

/// Filter for `directives`, with script lines silenced unless
/// `script_logs` is set
pub fn build_filter(directives: &str, script_logs: bool) -> TeeResult<EnvFilter> {
    let filter = EnvFilter::try_new(directives)
        .map_err(|e| TeeError::Config(format!("invalid log filter `{}`: {}", directives, e)))?;
    if script_logs {
        return Ok(filter);
    }

    let silence: Directive = format!("{}=off", SCRIPT_LOG_TARGET)
        .parse()
        .map_err(|e| TeeError::Config(format!("script log directive: {}", e)))?;
    Ok(filter.add_directive(silence))
}

fn format_layer(config: &LogConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(span_events);

    match config.format {
        LogFormat::Text => layer.with_ansi(config.color).boxed(),
        LogFormat::Compact => layer.compact().with_ansi(config.color).boxed(),
        LogFormat::Json => layer.json().with_ansi(false).boxed(),
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. Fails if a global subscriber
/// is already installed.
pub fn init_logging(config: &LogConfig) -> TeeResult<()> {
    let directives =
        std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| config.level.clone());
    let filter = build_filter(&directives, config.script_logs)?;

    tracing_subscriber::registry()
        .with(format_layer(config).with_filter(filter))
        .try_init()
        .map_err(|e| TeeError::Config(format!("failed to initialize logging: {}", e)))?;

    tracing::info!(
        filter = %directives,
        format = ?config.format,
        script_logs = config.script_logs,
        "logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Text);
        assert!(config.color);
        assert!(!config.span_events);
        assert!(!config.script_logs);
    }

    #[test]
    fn test_filter_silences_script_lines() {
        let silenced = build_filter("debug", false).unwrap().to_string();
        assert!(silenced.contains("neo_enclave::script=off"), "{silenced}");

        let mirrored = build_filter("debug", true).unwrap().to_string();
        assert!(!mirrored.contains("neo_enclave::script"), "{mirrored}");
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        let err = build_filter("neo_enclave=loudest", false).unwrap_err();
        assert!(matches!(err, TeeError::Config(_)));
    }

    #[test]
    fn test_second_init_is_rejected() {
        let config = LogConfig {
            level: "warn".to_string(),
            format: LogFormat::Compact,
            color: false,
            ..Default::default()
        };

        // Another test may have installed a subscriber first, so only the
        // second call is asserted.
        let _ = init_logging(&config);
        let err = init_logging(&config).unwrap_err();
        assert!(matches!(err, TeeError::Config(_)));
    }

    #[test]
    fn test_logging_section_from_enclave_config() {
        let config = crate::config::EnclaveConfig::from_toml_str(
            "[logging]\nlevel = \"debug\"\nformat = \"json\"\nscript_logs = true\n",
        )
        .unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.logging.script_logs);
        assert!(build_filter(&config.logging.level, config.logging.script_logs).is_ok());
    }
}
