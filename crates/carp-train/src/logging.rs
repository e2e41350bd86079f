//! Tracing subscriber setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{TrainError, TrainResult};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `carp_train=debug`.
    pub level: String,
    /// Output format: `pretty`, `compact` or `full`.
    pub format: String,
    /// Include source file and line in events.
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            include_location: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging values.
    pub fn validate(&self) -> Result<(), String> {
        EnvFilter::try_new(&self.level)
            .map_err(|e| format!("invalid level '{}': {}", self.level, e))?;
        match self.format.as_str() {
            "pretty" | "compact" | "full" => Ok(()),
            other => Err(format!(
                "format must be one of pretty, compact, full; got '{}'",
                other
            )),
        }
    }
}

/// Install a global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level` when set.
///
/// # Errors
/// `TrainError::Config` if the filter is invalid or a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> TrainResult<()> {
    config
        .validate()
        .map_err(|message| TrainError::Config { message })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| TrainError::Config {
            message: format!("Invalid log filter: {}", e),
        })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let result = match config.format.as_str() {
        "pretty" => builder.pretty().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };

    result.map_err(|e| TrainError::Config {
        message: format!("Failed to install tracing subscriber: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging_valid() {
        assert!(LoggingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_unknown_format_rejected() {
        let config = LoggingConfig {
            format: "xml".to_string(),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("xml"));
    }
}
