//! Full-batch gradients to compare gradient-cached results against.

use std::collections::HashMap;

use candle_core::{Tensor, TensorId};
use carp_train::config::Precision;
use carp_train::training::GradientAccumulator;
use carp_train::{contrastive_loss, CarpModel, TokenBatch};

/// Gradients of one ordinary backward pass over the whole batch.
///
/// Both towers and the logit scale are live.
pub fn full_batch_gradients(
    model: &CarpModel,
    passages: &TokenBatch,
    reviews: &TokenBatch,
) -> HashMap<TensorId, Tensor> {
    let p = model.encode_passages(passages).expect("encode passages");
    let r = model.encode_reviews(reviews).expect("encode reviews");
    let scale = model.logit_scale().scale(true).expect("logit scale");
    let out = contrastive_loss(&p, &r, &scale, Precision::F32).expect("full-batch loss");
    let store = out.loss.backward().expect("full-batch backward");

    model
        .trainable_vars()
        .iter()
        .filter_map(|v| {
            store
                .get(v.as_tensor())
                .map(|g| (v.as_tensor().id(), g.clone()))
        })
        .collect()
}

/// Largest element-wise absolute difference of two same-shape tensors.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .and_then(|d| d.abs())
        .and_then(|d| d.flatten_all())
        .and_then(|d| d.max(0))
        .and_then(|d| d.to_scalar::<f32>())
        .expect("tensor difference")
}

/// Assert every parameter's accumulated gradient matches the reference.
///
/// Tolerance is relative to the reference gradient's magnitude.
pub fn assert_grads_close(
    model: &CarpModel,
    accumulated: &GradientAccumulator,
    reference: &HashMap<TensorId, Tensor>,
    tolerance: f32,
) {
    for (index, var) in model.trainable_vars().iter().enumerate() {
        let id = var.as_tensor().id();
        let expected = reference
            .get(&id)
            .unwrap_or_else(|| panic!("parameter {} has no reference gradient", index));
        let actual = accumulated
            .get(var)
            .unwrap_or_else(|| panic!("parameter {} has no accumulated gradient", index));

        let diff = max_abs_diff(actual, expected);
        let magnitude = expected
            .abs()
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.max(0))
            .and_then(|t| t.to_scalar::<f32>())
            .expect("reference magnitude");
        assert!(
            diff <= tolerance * magnitude.max(1.0),
            "parameter {} {:?}: max diff {} exceeds tolerance (|g|max = {})",
            index,
            var.dims(),
            diff,
            magnitude
        );
    }
}
