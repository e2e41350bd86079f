//! Validation pass without gradient history or parameter updates.

use std::collections::HashMap;

use crate::batch::TokenBatch;
use crate::config::Precision;
use crate::error::{TrainError, TrainResult};
use crate::model::ops::scalar_f32;
use crate::model::CarpModel;

use super::loss::{backward_accuracy, forward_accuracy, similarity_logits, symmetric_cross_entropy};
use super::partition::generate_indices;

/// Mean validation diagnostics over a set of batches.
#[derive(Debug, Clone, Default)]
pub struct EvalMetrics {
    pub loss: f32,
    pub forward_acc: f32,
    pub backward_acc: f32,
    pub num_batches: usize,
}

impl EvalMetrics {
    pub fn to_map(&self) -> HashMap<String, f32> {
        HashMap::from([
            ("Loss/Validation".to_string(), self.loss),
            ("Acc/Forward/Validation".to_string(), self.forward_acc),
            ("Acc/Backward/Validation".to_string(), self.backward_acc),
        ])
    }
}

impl CarpModel {
    /// Evaluate loss and both accuracies, averaged over `batches`.
    ///
    /// Embeddings are built microbatch by microbatch and detached, so memory
    /// stays bounded the same way as in training.
    pub fn eval_step(
        &self,
        batches: &[(TokenBatch, TokenBatch)],
        microbatch_size: usize,
    ) -> TrainResult<EvalMetrics> {
        if batches.is_empty() {
            return Err(TrainError::InvalidInput(
                "validation requires at least one batch".to_string(),
            ));
        }

        let mut totals = EvalMetrics::default();
        for (passages, reviews) in batches {
            if passages.len() != reviews.len() {
                return Err(TrainError::DimensionMismatch {
                    expected: passages.len(),
                    actual: reviews.len(),
                });
            }
            let groups = generate_indices(passages.len(), microbatch_size)?;
            let (passage_cache, review_cache) =
                self.calculate_embeddings(&passages.split(&groups)?, &reviews.split(&groups)?)?;

            let logits = similarity_logits(
                &passage_cache.concat()?,
                &review_cache.concat()?,
                &self.logit_scale().scale(false)?,
                Precision::F32,
            )?;

            totals.loss += scalar_f32(&symmetric_cross_entropy(&logits)?)?;
            totals.forward_acc += forward_accuracy(&logits)?;
            totals.backward_acc += backward_accuracy(&logits)?;
            totals.num_batches += 1;
        }

        let n = totals.num_batches as f32;
        let metrics = EvalMetrics {
            loss: totals.loss / n,
            forward_acc: totals.forward_acc / n,
            backward_acc: totals.backward_acc / n,
            num_batches: totals.num_batches,
        };

        tracing::info!(
            "Validation: loss={:.4}, acc_fwd={:.3}, acc_bwd={:.3} over {} batches",
            metrics.loss,
            metrics.forward_acc,
            metrics.backward_acc,
            metrics.num_batches
        );
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_map_keys() {
        let metrics = EvalMetrics {
            loss: 0.5,
            forward_acc: 1.0,
            backward_acc: 0.75,
            num_batches: 2,
        };
        let map = metrics.to_map();
        assert_eq!(map["Loss/Validation"], 0.5);
        assert_eq!(map["Acc/Forward/Validation"], 1.0);
        assert_eq!(map["Acc/Backward/Validation"], 0.75);
    }
}
