//! Two-tower CARP model: passage tower, review tower, shared logit scale.

use candle_core::{Device, Tensor, Var};

use crate::batch::TokenBatch;
use crate::config::ModelConfig;
use crate::error::{TrainError, TrainResult};

use super::temperature::LogitScale;
use super::tower::Tower;

/// Contrastive passage/review model.
///
/// Parameters persist across steps; the model is read through `&self` during
/// a step and only written by the optimizer.
#[derive(Debug)]
pub struct CarpModel {
    passage: Tower,
    review: Tower,
    logit_scale: LogitScale,
    config: ModelConfig,
    device: Device,
}

impl CarpModel {
    /// Build both towers and the logit scale.
    ///
    /// The review tower is seeded with `config.seed + 1` so the towers start
    /// from different weights.
    ///
    /// # Errors
    /// - `TrainError::Config` if `config` is invalid or the device is unavailable
    /// - `TrainError::WeightLoad` if base weights cannot be loaded
    pub fn new(config: ModelConfig) -> TrainResult<Self> {
        config
            .validate()
            .map_err(|message| TrainError::Config { message })?;
        let device = config.device.to_device()?;

        let passage = Tower::new(&config, &device, config.seed)?;
        let review = Tower::new(&config, &device, config.seed.wrapping_add(1))?;
        let logit_scale = LogitScale::new(config.init_temperature, &device)?;

        tracing::info!(
            "Initialized CARP model: encoder={}, latent_dim={}, projection={}, tensors={}",
            config.encoder_type.name(),
            config.latent_dim,
            if config.linear_projection { "linear" } else { "mlp" },
            passage.trainable_vars().len() + review.trainable_vars().len() + 1
        );

        Ok(Self {
            passage,
            review,
            logit_scale,
            config,
            device,
        })
    }

    /// Passage latents `[m, latent_dim]`, gradient-tracked.
    pub fn encode_passages(&self, batch: &TokenBatch) -> TrainResult<Tensor> {
        self.passage.encode(batch)
    }

    /// Review latents `[m, latent_dim]`, gradient-tracked.
    pub fn encode_reviews(&self, batch: &TokenBatch) -> TrainResult<Tensor> {
        self.review.encode(batch)
    }

    pub fn passage_tower(&self) -> &Tower {
        &self.passage
    }

    pub fn review_tower(&self) -> &Tower {
        &self.review
    }

    pub fn logit_scale(&self) -> &LogitScale {
        &self.logit_scale
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// All trainable parameters: passage tower, review tower, logit scale.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.passage.trainable_vars();
        vars.extend(self.review.trainable_vars());
        vars.push(self.logit_scale.var().clone());
        vars
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.trainable_vars().iter().map(|v| v.elem_count()).sum()
    }
}
