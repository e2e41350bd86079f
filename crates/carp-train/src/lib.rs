//! Gradient-cached contrastive training for CARP passage/review models.
//!
//! Trains a two-tower model whose passage and review encoders project into a
//! shared latent space, using a symmetric contrastive loss over the whole
//! batch while only ever holding gradient history for one microbatch.
//!
//! # Architecture
//!
//! - **config**: TOML / environment configuration (`CarpConfig`)
//! - **model**: encoders, projections, logit scale (`CarpModel`)
//! - **training**: partitioning, caches, loss, scaler, optimizer, step
//! - **logging**: tracing subscriber setup
//!
//! # Example
//!
//! ```rust,ignore
//! use carp_train::{AdamW, CarpConfig, CarpModel, GradScaler};
//!
//! let config = CarpConfig::load()?;
//! let model = CarpModel::new(config.model.clone())?;
//! let mut optimizer = AdamW::new(model.trainable_vars(), config.train.optimizer)?;
//! let mut scaler = GradScaler::new(config.train.scaler)?;
//!
//! let metrics = model.train_step(&passages, &reviews, &config.train, &mut optimizer, &mut scaler)?;
//! println!("{:?}", metrics.to_map());
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod training;

pub use batch::TokenBatch;
pub use config::{CarpConfig, EncoderKind, ModelConfig, Precision, TrainConfig};
pub use error::{TrainError, TrainResult};
pub use logging::{init_logging, LoggingConfig};
pub use model::CarpModel;
pub use training::{
    contrastive_loss, generate_indices, AdamW, EmbeddingCache, EvalMetrics, GradScaler,
    GradientAccumulator, Optimizer, Sgd, StepMetrics,
};
