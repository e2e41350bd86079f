//! Shared fixtures for carp-train integration tests.
//!
//! - [`fixtures`]: tiny configurations and synthetic token batches
//! - [`reference`]: full-batch gradient reference and tolerance checks

pub mod fixtures;
pub mod reference;

pub use fixtures::{init_test_logging, synthetic_token_batch, tiny_model_config, tiny_train_config};
pub use reference::{assert_grads_close, full_batch_gradients, max_abs_diff};
