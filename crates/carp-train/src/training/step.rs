//! Gradient-cached training step.
//!
//! # Algorithm
//!
//! ```text
//! groups = generate_indices(N, M)
//! P̃, R̃   = detached caches over groups            (no gradient history)
//!
//! for i in groups:                                  passage sweep
//!     P = P̃ with entry i ← passage_tower(group i)   (live)
//!     backward(scale · L(P, R̃))
//! for i in groups:                                  review sweep
//!     R = R̃ with entry i ← review_tower(group i)    (live)
//!     backward(scale · L(P̃, R))
//!
//! [unscale, clip]  →  scaler.step(optimizer)  →  scaler.update()
//! ```
//!
//! Every evaluation sees the same full-batch loss value, and each backward
//! pass differentiates only one microbatch's embeddings, so the summed
//! gradients equal those of one full-batch backward pass. The logit scale is
//! live only in the first passage-sweep evaluation for the same reason.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::batch::TokenBatch;
use crate::config::TrainConfig;
use crate::error::{TrainError, TrainResult};
use crate::model::CarpModel;

use super::gradients::GradientAccumulator;
use super::loss::contrastive_loss;
use super::optimizer::Optimizer;
use super::partition::generate_indices;
use super::scaler::GradScaler;

/// Diagnostics of one training step.
///
/// Loss and accuracy are the values of the last microbatch evaluation, not
/// aggregates.
#[derive(Debug, Clone, Default)]
pub struct StepMetrics {
    /// Loss of the final review-sweep evaluation.
    pub contrastive_loss: f32,
    /// Same value as `contrastive_loss`.
    pub train_loss: f32,
    /// Forward accuracy of the final passage-sweep evaluation.
    pub forward_acc: f32,
    /// Backward calls performed (2 × groups).
    pub backward_passes: usize,
    /// Microbatch groups per tower.
    pub num_microbatches: usize,
    /// Global gradient norm before clipping, when clipping ran.
    pub grad_norm: Option<f32>,
    /// Loss scale used for this step's backward passes.
    pub loss_scale: f64,
    /// Whether the scaler skipped the optimizer step.
    pub skipped: bool,
}

impl StepMetrics {
    /// Named diagnostics, keyed as reported to training logs.
    pub fn to_map(&self) -> HashMap<String, f32> {
        HashMap::from([
            ("Loss/Contrastive".to_string(), self.contrastive_loss),
            ("Loss/Train".to_string(), self.train_loss),
            ("Acc/Forward".to_string(), self.forward_acc),
        ])
    }

    /// Whether loss and accuracy are finite.
    pub fn is_finite(&self) -> bool {
        self.contrastive_loss.is_finite() && self.forward_acc.is_finite()
    }
}

/// Outcome of the two gradient sweeps, before any optimizer interaction.
#[derive(Debug, Clone)]
pub struct CachedGradients {
    pub last_loss: f32,
    pub forward_acc: f32,
    pub backward_passes: usize,
    pub num_microbatches: usize,
}

/// Reject batches the step cannot pair.
fn validate_pair(passages: &TokenBatch, reviews: &TokenBatch, n_ctx: usize) -> TrainResult<()> {
    if passages.is_empty() || reviews.is_empty() {
        return Err(TrainError::InvalidInput(
            "training step requires non-empty passage and review batches".to_string(),
        ));
    }
    if passages.len() != reviews.len() {
        return Err(TrainError::DimensionMismatch {
            expected: passages.len(),
            actual: reviews.len(),
        });
    }
    let longest = passages.seq_len().max(reviews.seq_len());
    if longest > n_ctx {
        return Err(TrainError::InvalidInput(format!(
            "sequence length {} exceeds n_ctx {}",
            longest, n_ctx
        )));
    }
    Ok(())
}

impl CarpModel {
    /// Sum the gradient-cached gradients of one batch into `grads`.
    ///
    /// Runs the cache pass and both sweeps; the caller owns zeroing,
    /// clipping and stepping. Each backward pass is scaled by `scaler`.
    ///
    /// # Errors
    /// - `TrainError::InvalidInput` if either batch is empty or longer than `n_ctx`
    /// - `TrainError::DimensionMismatch` if the batches differ in size
    /// - `TrainError::Config` if `config.microbatch_size` or `config.n_ctx` is
    ///   zero, or `config.grad_clip` is neither positive nor the disable value
    pub fn accumulate_cached_gradients(
        &self,
        passages: &TokenBatch,
        reviews: &TokenBatch,
        config: &TrainConfig,
        grads: &mut GradientAccumulator,
        scaler: &GradScaler,
    ) -> TrainResult<CachedGradients> {
        config
            .validate_step()
            .map_err(|message| TrainError::Config { message })?;
        validate_pair(passages, reviews, config.n_ctx)?;

        let groups = generate_indices(passages.len(), config.microbatch_size)?;
        let passage_mbs = passages.split(&groups)?;
        let review_mbs = reviews.split(&groups)?;

        let (passage_cache, review_cache) =
            self.calculate_embeddings(&passage_mbs, &review_mbs)?;
        let passage_full = passage_cache.concat()?;
        let review_full = review_cache.concat()?;

        let mut forward_acc = 0.0f32;
        let mut last_loss = f32::NAN;

        for (i, mb) in passage_mbs.iter().enumerate() {
            let live = self.encode_passages(mb)?;
            let passages_i = passage_cache.substitute(i, live)?.concat()?;
            let scale = self.logit_scale().scale(i == 0)?;

            let out = contrastive_loss(&passages_i, &review_full, &scale, config.precision)?;
            last_loss = out.loss_value()?;
            forward_acc = out.forward_acc;

            backward_scaled(&out.loss, scaler, grads)?;
            tracing::debug!(
                "Passage microbatch {}/{}: loss={:.4}, acc={:.3}",
                i + 1,
                groups.len(),
                last_loss,
                forward_acc
            );
        }

        for (i, mb) in review_mbs.iter().enumerate() {
            let live = self.encode_reviews(mb)?;
            let reviews_i = review_cache.substitute(i, live)?.concat()?;
            let scale = self.logit_scale().scale(false)?;

            let out = contrastive_loss(&passage_full, &reviews_i, &scale, config.precision)?;
            last_loss = out.loss_value()?;

            backward_scaled(&out.loss, scaler, grads)?;
            tracing::debug!(
                "Review microbatch {}/{}: loss={:.4}",
                i + 1,
                groups.len(),
                last_loss
            );
        }

        Ok(CachedGradients {
            last_loss,
            forward_acc,
            backward_passes: 2 * groups.len(),
            num_microbatches: groups.len(),
        })
    }

    /// One full optimisation step over a passage/review batch.
    ///
    /// Zeroes gradients, accumulates gradient-cached gradients for both
    /// towers, clips when `config.grad_clip` is enabled (after unscaling),
    /// then steps through the scaler and updates its scale.
    pub fn train_step<O: Optimizer + ?Sized>(
        &self,
        passages: &TokenBatch,
        reviews: &TokenBatch,
        config: &TrainConfig,
        optimizer: &mut O,
        scaler: &mut GradScaler,
    ) -> TrainResult<StepMetrics> {
        optimizer.zero_grad();
        let loss_scale = scaler.current_scale();

        let cached = self.accumulate_cached_gradients(
            passages,
            reviews,
            config,
            optimizer.gradients_mut(),
            scaler,
        )?;

        let grad_norm = if config.grad_clip_enabled() {
            match unscale_and_clip(optimizer.gradients_mut(), scaler, config.grad_clip) {
                Ok(norm) => Some(norm as f32),
                Err(err) => {
                    scaler.discard_step();
                    return Err(err);
                }
            }
        } else {
            None
        };

        let stepped = scaler.step(optimizer)?;
        scaler.update()?;

        let metrics = StepMetrics {
            contrastive_loss: cached.last_loss,
            train_loss: cached.last_loss,
            forward_acc: cached.forward_acc,
            backward_passes: cached.backward_passes,
            num_microbatches: cached.num_microbatches,
            grad_norm,
            loss_scale,
            skipped: !stepped,
        };

        if !metrics.is_finite() {
            tracing::warn!(
                "Non-finite training loss {} (acc {})",
                metrics.contrastive_loss,
                metrics.forward_acc
            );
        }
        tracing::info!(
            "Train step: loss={:.4}, acc={:.3}, microbatches={}, scale={}, skipped={}",
            metrics.contrastive_loss,
            metrics.forward_acc,
            metrics.num_microbatches,
            metrics.loss_scale,
            metrics.skipped
        );

        Ok(metrics)
    }
}

fn unscale_and_clip(
    grads: &mut GradientAccumulator,
    scaler: &mut GradScaler,
    max_norm: f64,
) -> TrainResult<f64> {
    scaler.unscale(grads)?;
    grads.clip_global_norm(max_norm)
}

fn backward_scaled(
    loss: &Tensor,
    scaler: &GradScaler,
    grads: &mut GradientAccumulator,
) -> TrainResult<()> {
    let scaled = scaler.scale(loss)?;
    let store = scaled
        .backward()
        .map_err(|e| TrainError::tensor("microbatch backward", e))?;
    grads.accumulate(&store)
}

/// Number of groups a batch of `n` splits into.
pub fn num_microbatches(n: usize, microbatch_size: usize) -> TrainResult<usize> {
    Ok(generate_indices(n, microbatch_size)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_map_keys() {
        let metrics = StepMetrics {
            contrastive_loss: 1.5,
            train_loss: 1.5,
            forward_acc: 0.25,
            ..Default::default()
        };
        let map = metrics.to_map();
        assert_eq!(map.len(), 3);
        assert_eq!(map["Loss/Contrastive"], 1.5);
        assert_eq!(map["Loss/Train"], 1.5);
        assert_eq!(map["Acc/Forward"], 0.25);
    }

    #[test]
    fn test_metrics_non_finite() {
        let metrics = StepMetrics {
            contrastive_loss: f32::NAN,
            ..Default::default()
        };
        assert!(!metrics.is_finite());
    }

    #[test]
    fn test_num_microbatches() {
        assert_eq!(num_microbatches(5, 2).unwrap(), 3);
        assert!(num_microbatches(5, 0).is_err());
    }
}
