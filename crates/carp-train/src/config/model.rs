//! Model configuration: towers, projection and device placement.

use std::path::PathBuf;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};

/// Pooling strategy applied on top of the base sequence encoder.
///
/// Closed set of encoder kinds. The serde names match the registry keys used
/// by existing CARP configuration files, so `encoder_type = "MeanPoolEncoder"`
/// resolves here at load time rather than through a runtime registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncoderKind {
    /// Masked sum over token states.
    #[serde(rename = "SumTextEncoder", alias = "sum")]
    Sum,
    /// Masked mean over token states.
    #[default]
    #[serde(rename = "MeanPoolEncoder", alias = "mean_pool")]
    MeanPool,
    /// State of the last unmasked token.
    #[serde(rename = "EOTTextEncoder", alias = "eot")]
    EndOfText,
    /// State of the first token.
    #[serde(rename = "DirectTextEncoder", alias = "direct")]
    Direct,
}

impl EncoderKind {
    /// Registry name of this encoder kind.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sum => "SumTextEncoder",
            Self::MeanPool => "MeanPoolEncoder",
            Self::EndOfText => "EOTTextEncoder",
            Self::Direct => "DirectTextEncoder",
        }
    }
}

/// Shape of the base sequence encoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncoderArch {
    /// Token vocabulary size.
    pub vocab_size: usize,
    /// Width of token states.
    pub hidden_size: usize,
    /// Maximum sequence length covered by position embeddings.
    pub max_positions: usize,
    /// Layer norm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for EncoderArch {
    fn default() -> Self {
        Self {
            vocab_size: 32_000,
            hidden_size: 256,
            max_positions: 512,
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

impl EncoderArch {
    /// Validate architecture values.
    pub fn validate(&self) -> Result<(), String> {
        if self.vocab_size == 0 {
            return Err("vocab_size must be greater than 0".to_string());
        }
        if self.hidden_size == 0 {
            return Err("hidden_size must be greater than 0".to_string());
        }
        if self.max_positions == 0 {
            return Err("max_positions must be greater than 0".to_string());
        }
        if !(self.layer_norm_eps > 0.0) {
            return Err(format!(
                "layer_norm_eps must be positive, got {}",
                self.layer_norm_eps
            ));
        }
        Ok(())
    }
}

/// Compute device for model parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    /// CUDA device ordinal.
    Cuda(usize),
    /// Metal device ordinal.
    Metal(usize),
}

impl DeviceKind {
    /// Open the candle device.
    ///
    /// # Errors
    /// `TrainError::Config` if the device is unavailable (for example when the
    /// crate was built without the matching feature).
    pub fn to_device(self) -> TrainResult<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|e| TrainError::Config {
                message: format!("CUDA device {} unavailable: {}", ordinal, e),
            }),
            Self::Metal(ordinal) => {
                Device::new_metal(ordinal).map_err(|e| TrainError::Config {
                    message: format!("Metal device {} unavailable: {}", ordinal, e),
                })
            }
        }
    }
}

/// Configuration for the two-tower model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Dimension of the shared latent space.
    pub latent_dim: usize,
    /// Device placement.
    #[serde(default)]
    pub device: DeviceKind,
    /// Pooling strategy of both towers.
    #[serde(default)]
    pub encoder_type: EncoderKind,
    /// Directory holding `model.safetensors` base weights. Seeded random
    /// initialisation when unset.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Base encoder shape.
    #[serde(default)]
    pub model_arch: EncoderArch,
    /// Use a bias-free linear projection instead of the GELU MLP projection.
    #[serde(default)]
    pub linear_projection: bool,
    /// Initial softmax temperature; the stored parameter is `ln(1 / t)`.
    #[serde(default = "default_init_temperature")]
    pub init_temperature: f64,
    /// Seed for deterministic parameter initialisation.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_init_temperature() -> f64 {
    0.07
}

fn default_seed() -> u64 {
    0xCA4F
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            latent_dim: 2048,
            device: DeviceKind::default(),
            encoder_type: EncoderKind::default(),
            model_path: None,
            model_arch: EncoderArch::default(),
            linear_projection: false,
            init_temperature: default_init_temperature(),
            seed: default_seed(),
        }
    }
}

impl ModelConfig {
    /// Validate model configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.latent_dim == 0 {
            return Err("latent_dim must be greater than 0".to_string());
        }
        if !(self.init_temperature > 0.0 && self.init_temperature.is_finite()) {
            return Err(format!(
                "init_temperature must be positive and finite, got {}",
                self.init_temperature
            ));
        }
        self.model_arch
            .validate()
            .map_err(|e| format!("model_arch: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_kind_registry_names() {
        let kind: EncoderKind = toml::from_str::<Wrapper>("kind = \"EOTTextEncoder\"")
            .unwrap()
            .kind;
        assert_eq!(kind, EncoderKind::EndOfText);
        assert_eq!(kind.name(), "EOTTextEncoder");

        let alias: EncoderKind = toml::from_str::<Wrapper>("kind = \"sum\"").unwrap().kind;
        assert_eq!(alias, EncoderKind::Sum);
    }

    #[test]
    fn test_unknown_encoder_kind_rejected() {
        let parsed = toml::from_str::<Wrapper>("kind = \"GPTEncoder\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_default_model_config_valid() {
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_latent_dim_rejected() {
        let config = ModelConfig {
            latent_dim: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("latent_dim"));
    }

    #[test]
    fn test_arch_zero_hidden_rejected() {
        let arch = EncoderArch {
            hidden_size: 0,
            ..Default::default()
        };
        assert!(arch.validate().is_err());
    }

    #[test]
    fn test_cpu_device_opens() {
        assert!(DeviceKind::Cpu.to_device().unwrap().is_cpu());
    }

    #[derive(Deserialize)]
    struct Wrapper {
        kind: EncoderKind,
    }
}
