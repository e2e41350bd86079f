//! Training step configuration.

use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Gradient clip threshold value that disables clipping.
pub const GRAD_CLIP_DISABLED: f64 = -1.0;

/// Arithmetic precision used for the similarity computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F16,
    Bf16,
}

impl Precision {
    /// Tensor dtype for this precision.
    pub fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }

    /// Whether this is a reduced precision mode.
    pub fn is_reduced(self) -> bool {
        !matches!(self, Self::F32)
    }
}

/// Optimizer hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Learning rate (default: 1e-4).
    pub learning_rate: f64,
    /// Decoupled weight decay (default: 0.01).
    pub weight_decay: f64,
    /// First moment decay (default: 0.9).
    pub beta1: f64,
    /// Second moment decay (default: 0.999).
    pub beta2: f64,
    /// Denominator epsilon (default: 1e-8).
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            weight_decay: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Validate optimizer values.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            ));
        }
        if self.weight_decay < 0.0 {
            return Err(format!(
                "weight_decay must be non-negative, got {}",
                self.weight_decay
            ));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(format!("{} must be in [0, 1), got {}", name, beta));
            }
        }
        if !(self.eps > 0.0) {
            return Err(format!("eps must be positive, got {}", self.eps));
        }
        Ok(())
    }
}

/// Dynamic loss scaler settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerConfig {
    /// Whether loss scaling is active. Disabled scalers pass values through.
    pub enabled: bool,
    /// Starting scale (default: 2^16).
    pub init_scale: f64,
    /// Multiplier applied after `growth_interval` clean steps (default: 2.0).
    pub growth_factor: f64,
    /// Multiplier applied after a step with non-finite gradients (default: 0.5).
    pub backoff_factor: f64,
    /// Clean steps required before growing the scale (default: 2000).
    pub growth_interval: u32,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init_scale: 65_536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

impl ScalerConfig {
    /// Scaler configuration that never rescales.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Validate scaler values.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.init_scale > 0.0 && self.init_scale.is_finite()) {
            return Err(format!("init_scale must be positive, got {}", self.init_scale));
        }
        if !(self.growth_factor > 1.0) {
            return Err(format!(
                "growth_factor must be greater than 1, got {}",
                self.growth_factor
            ));
        }
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            return Err(format!(
                "backoff_factor must be in (0, 1), got {}",
                self.backoff_factor
            ));
        }
        if self.growth_interval == 0 {
            return Err("growth_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Configuration consumed by the training step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Examples per full training batch, as produced by the data loader.
    ///
    /// Only [`validate`](Self::validate) reads it, to bound
    /// `microbatch_size`; the step itself accepts any non-empty batch.
    pub batch_size: usize,
    /// Examples per microbatch during gradient caching.
    pub microbatch_size: usize,
    /// Maximum token sequence length.
    pub n_ctx: usize,
    /// Global gradient norm threshold, or [`GRAD_CLIP_DISABLED`].
    #[serde(default = "default_grad_clip")]
    pub grad_clip: f64,
    /// Precision of the similarity computation.
    #[serde(default)]
    pub precision: Precision,
    /// Optimizer hyperparameters.
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Loss scaler settings.
    #[serde(default)]
    pub scaler: ScalerConfig,
}

fn default_grad_clip() -> f64 {
    GRAD_CLIP_DISABLED
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            microbatch_size: 8,
            n_ctx: 512,
            grad_clip: GRAD_CLIP_DISABLED,
            precision: Precision::default(),
            optimizer: OptimizerConfig::default(),
            scaler: ScalerConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Whether gradient clipping runs before the optimizer step.
    pub fn grad_clip_enabled(&self) -> bool {
        self.grad_clip != GRAD_CLIP_DISABLED
    }

    /// Validate the values a single training step reads.
    ///
    /// `batch_size` is not among them: the step trains on whatever N the
    /// caller passes, including a short final batch.
    pub fn validate_step(&self) -> Result<(), String> {
        if self.microbatch_size == 0 {
            return Err("microbatch_size must be greater than 0".to_string());
        }
        if self.n_ctx == 0 {
            return Err("n_ctx must be greater than 0".to_string());
        }
        if self.grad_clip_enabled() && !(self.grad_clip > 0.0 && self.grad_clip.is_finite()) {
            return Err(format!(
                "grad_clip must be positive or {} to disable, got {}",
                GRAD_CLIP_DISABLED, self.grad_clip
            ));
        }
        Ok(())
    }

    /// Validate training configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }
        self.validate_step()?;
        if self.microbatch_size > self.batch_size {
            return Err(format!(
                "microbatch_size ({}) cannot exceed batch_size ({})",
                self.microbatch_size, self.batch_size
            ));
        }
        self.optimizer
            .validate()
            .map_err(|e| format!("optimizer: {}", e))?;
        self.scaler.validate().map_err(|e| format!("scaler: {}", e))
    }
}
