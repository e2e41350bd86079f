//! Small, deterministic models and batches.
//!
//! Shapes are kept tiny so gradient comparisons run in milliseconds on CPU.

use candle_core::Device;
use carp_train::config::{
    EncoderArch, EncoderKind, ModelConfig, OptimizerConfig, ScalerConfig, TrainConfig,
    GRAD_CLIP_DISABLED,
};
use carp_train::TokenBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Vocabulary size of [`tiny_model_config`].
pub const TINY_VOCAB: usize = 32;

/// Maximum sequence length of [`tiny_model_config`].
pub const TINY_MAX_POSITIONS: usize = 12;

/// Two towers with 8-wide states projected to 6 dimensions.
pub fn tiny_model_config(kind: EncoderKind) -> ModelConfig {
    ModelConfig {
        latent_dim: 6,
        encoder_type: kind,
        model_arch: EncoderArch {
            vocab_size: TINY_VOCAB,
            hidden_size: 8,
            max_positions: TINY_MAX_POSITIONS,
            layer_norm_eps: 1e-5,
        },
        // well inside the clamp so the logit scale receives gradient
        init_temperature: 0.2,
        seed: 1234,
        ..Default::default()
    }
}

/// Train configuration with scaling disabled and no clipping.
pub fn tiny_train_config(batch_size: usize, microbatch_size: usize) -> TrainConfig {
    TrainConfig {
        batch_size,
        microbatch_size,
        n_ctx: TINY_MAX_POSITIONS,
        grad_clip: GRAD_CLIP_DISABLED,
        optimizer: OptimizerConfig {
            learning_rate: 1e-2,
            weight_decay: 0.0,
            ..Default::default()
        },
        scaler: ScalerConfig::disabled(),
        ..Default::default()
    }
}

/// `n` rows of random tokens with a random amount of trailing padding.
///
/// Every row keeps at least one real token.
pub fn synthetic_token_batch(n: usize, len: usize, vocab: usize, seed: u64, device: &Device) -> TokenBatch {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tokens = Vec::with_capacity(n);
    let mut mask = Vec::with_capacity(n);

    for _ in 0..n {
        let real = rng.gen_range(1..=len);
        tokens.push(
            (0..len)
                .map(|j| if j < real { rng.gen_range(1..vocab as u32) } else { 0 })
                .collect::<Vec<u32>>(),
        );
        mask.push((0..len).map(|j| u32::from(j < real)).collect::<Vec<u32>>());
    }

    TokenBatch::from_rows(&tokens, &mask, device).expect("synthetic batch shapes are consistent")
}

/// Install a test subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("carp_train=debug")
        .with_test_writer()
        .try_init();
}
