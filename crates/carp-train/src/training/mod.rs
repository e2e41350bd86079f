//! Gradient-cached contrastive training.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     train_step                           │
//! │  ┌─────────────┐   ┌───────────────┐   ┌──────────────┐  │
//! │  │ partition   │──>│ cache (no     │──>│ per-group    │  │
//! │  │ (N, M)      │   │ grad history) │   │ backward ×2K │  │
//! │  └─────────────┘   └───────────────┘   └──────┬───────┘  │
//! │                                               │          │
//! │  ┌──────────────┐   ┌───────────┐   ┌─────────▼───────┐  │
//! │  │ scaler       │<──│ clip      │<──│ gradients       │  │
//! │  │ step/update  │   │ (opt.)    │   │ (accumulate)    │  │
//! │  └──────┬───────┘   └───────────┘   └─────────────────┘  │
//! │         ▼                                                │
//! │    optimizer (AdamW / Sgd)                               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`partition`]: deterministic microbatch groups
//! - [`cache`]: detached embedding caches and substitution views
//! - [`loss`]: symmetric contrastive loss and accuracies
//! - [`gradients`]: accumulate-only gradient buffer with clipping
//! - [`scaler`]: dynamic loss scaling
//! - [`optimizer`]: `Optimizer` trait, AdamW and SGD
//! - [`step`]: the gradient-cached training step
//! - [`eval`]: validation pass

pub mod cache;
pub mod eval;
pub mod gradients;
pub mod loss;
pub mod optimizer;
pub mod partition;
pub mod scaler;
pub mod step;

pub use cache::{CacheView, EmbeddingCache};
pub use eval::EvalMetrics;
pub use gradients::GradientAccumulator;
pub use loss::{contrastive_loss, ContrastiveOutput};
pub use optimizer::{AdamW, Optimizer, Sgd};
pub use partition::{generate_indices, MicrobatchGroup};
pub use scaler::GradScaler;
pub use step::{CachedGradients, StepMetrics};
