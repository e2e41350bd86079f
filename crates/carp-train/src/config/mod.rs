//! Root configuration for contrastive training.
//!
//! # TOML Structure
//!
//! ```toml
//! [model]
//! latent_dim = 2048
//! encoder_type = "MeanPoolEncoder"
//! device = "cpu"
//! linear_projection = false
//!
//! [model.model_arch]
//! vocab_size = 32000
//! hidden_size = 256
//! max_positions = 512
//!
//! [train]
//! batch_size = 512
//! microbatch_size = 8
//! n_ctx = 512
//! grad_clip = -1.0
//! precision = "f16"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! include_location = false
//! ```
//!
//! Invalid configuration is an error; nothing silently falls back to defaults
//! once a file has been read.

mod model;
mod train;

pub use model::{DeviceKind, EncoderArch, EncoderKind, ModelConfig};
pub use train::{OptimizerConfig, Precision, ScalerConfig, TrainConfig, GRAD_CLIP_DISABLED};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};
use crate::logging::LoggingConfig;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarpConfig {
    /// Two-tower model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Training step settings.
    #[serde(default)]
    pub train: TrainConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CarpConfig {
    /// Load configuration from files and environment.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. `config/default.toml`
    /// 2. `config/{CARP_ENV}.toml` (`CARP_ENV` defaults to `development`)
    /// 3. Environment variables with the `CARP__` prefix, `__` separated
    ///    (e.g. `CARP__TRAIN__MICROBATCH_SIZE=16`)
    pub fn load() -> TrainResult<Self> {
        let env = std::env::var("CARP_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(
                config::Environment::with_prefix("CARP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `TrainError::Config` if the file cannot be read, parsed or validated
    pub fn from_file(path: impl AsRef<Path>) -> TrainResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| TrainError::Config {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        let config = Self::from_toml_str(&contents).map_err(|e| TrainError::Config {
            message: format!("{} ('{}')", e, path.display()),
        })?;

        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> TrainResult<Self> {
        let config: Self = toml::from_str(contents).map_err(|e| TrainError::Config {
            message: format!("Failed to parse TOML: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all sections, returning the first error found.
    pub fn validate(&self) -> TrainResult<()> {
        self.model.validate().map_err(|e| TrainError::Config {
            message: format!("[model] {}", e),
        })?;

        self.train.validate().map_err(|e| TrainError::Config {
            message: format!("[train] {}", e),
        })?;

        self.logging.validate().map_err(|e| TrainError::Config {
            message: format!("[logging] {}", e),
        })?;

        if self.train.n_ctx > self.model.model_arch.max_positions {
            return Err(TrainError::Config {
                message: format!(
                    "[train] n_ctx ({}) exceeds model_arch.max_positions ({})",
                    self.train.n_ctx, self.model.model_arch.max_positions
                ),
            });
        }

        Ok(())
    }
}
