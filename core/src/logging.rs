//! Logging setup using tracing.

use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    #[default]
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum level when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: String::from("info"), format: LogFormat::default(), with_target: false }
    }
}

impl LogConfig {
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

/// Install the global subscriber. Output goes to stderr so report output on stdout stays clean.
pub fn init_logging_with_config(config: &LogConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Json => {
            let layer = fmt::layer().json().with_writer(std::io::stderr).with_target(config.with_target);
            let _ = tracing_subscriber::registry().with(env_filter).with(layer).try_init();
        }
        LogFormat::Compact => {
            let layer = fmt::layer().compact().with_writer(std::io::stderr).with_target(config.with_target);
            let _ = tracing_subscriber::registry().with(env_filter).with(layer).try_init();
        }
        LogFormat::Pretty => {
            let layer = fmt::layer().pretty().with_writer(std::io::stderr).with_target(config.with_target);
            let _ = tracing_subscriber::registry().with(env_filter).with(layer).try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_config_builder() {
        let config = LogConfig::default().level("debug").format(LogFormat::Json);
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn missing_format_key_keeps_the_default_format() {
        assert_eq!(LogFormat::default(), LogFormat::Compact);
        let config: LogConfig = serde_json::from_str(r#"{"level": "warn"}"#).unwrap();
        assert_eq!(config.format, LogConfig::default().format);
    }
}
