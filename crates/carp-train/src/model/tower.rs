//! One encoder + projection pipeline.

use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::batch::TokenBatch;
use crate::config::ModelConfig;
use crate::error::TrainResult;

use super::encoder::TextEncoder;
use super::projection::ProjectionLayer;

/// Offset separating the projection RNG stream from the encoder's.
const PROJECTION_SEED_OFFSET: u64 = 0x9E37_79B9;

/// Encoder followed by a projection into the latent space.
#[derive(Debug)]
pub struct Tower {
    encoder: TextEncoder,
    projector: ProjectionLayer,
}

impl Tower {
    /// Build a tower from model configuration with its own seed.
    pub fn new(config: &ModelConfig, device: &Device, seed: u64) -> TrainResult<Self> {
        let encoder = TextEncoder::new(
            config.encoder_type,
            config.model_path.as_deref(),
            config.model_arch,
            device,
            seed,
        )?;

        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(PROJECTION_SEED_OFFSET));
        let projector = if config.linear_projection {
            ProjectionLayer::linear(encoder.d_model(), config.latent_dim, &mut rng, device)?
        } else {
            ProjectionLayer::mlp(encoder.d_model(), config.latent_dim, &mut rng, device)?
        };

        Ok(Self { encoder, projector })
    }

    /// Latent embeddings `[m, latent_dim]`.
    pub fn encode(&self, batch: &TokenBatch) -> TrainResult<Tensor> {
        let pooled = self.encoder.encode(batch)?;
        self.projector.forward(&pooled)
    }

    pub fn encoder(&self) -> &TextEncoder {
        &self.encoder
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.encoder.trainable_vars();
        vars.extend(self.projector.trainable_vars());
        vars
    }
}
