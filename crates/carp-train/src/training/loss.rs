//! Symmetric contrastive loss over passage/review embeddings.
//!
//! ```text
//! S[i][j] = cos(P[i], R[j]) * exp(clamp(t, ln(1/100), ln(100)))
//! L = (CE(S, 0..N) + CE(Sᵀ, 0..N)) / 2
//! ```
//!
//! Row i of P is paired with row i of R; every other row of the batch serves
//! as an in-batch negative.

use candle_core::{DType, Tensor};

use crate::config::Precision;
use crate::error::{TrainError, TrainResult};
use crate::model::ops::{l2_normalize, scalar_f32};

/// Loss tensor (differentiable) and forward accuracy of one evaluation.
#[derive(Debug, Clone)]
pub struct ContrastiveOutput {
    /// Scalar loss, still attached to whatever inputs carried gradient history.
    pub loss: Tensor,
    /// Fraction of rows whose best match is their own pair.
    pub forward_acc: f32,
}

impl ContrastiveOutput {
    /// Loss as a host value.
    pub fn loss_value(&self) -> TrainResult<f32> {
        scalar_f32(&self.loss)
    }
}

/// Scaled cosine similarity matrix `[N, N]` in f32.
///
/// Under reduced precision the matmul runs in that dtype and the logits are
/// cast back to f32 before softmax. BF16 on CPU rounds the inputs to BF16
/// and multiplies in f32.
pub fn similarity_logits(
    passages: &Tensor,
    reviews: &Tensor,
    logit_scale: &Tensor,
    precision: Precision,
) -> TrainResult<Tensor> {
    let (n_p, d_p) = passages
        .dims2()
        .map_err(|e| TrainError::tensor("passage embeddings must be [N, D]", e))?;
    let (n_r, d_r) = reviews
        .dims2()
        .map_err(|e| TrainError::tensor("review embeddings must be [N, D]", e))?;

    if n_p != n_r {
        return Err(TrainError::DimensionMismatch {
            expected: n_p,
            actual: n_r,
        });
    }
    if d_p != d_r {
        return Err(TrainError::DimensionMismatch {
            expected: d_p,
            actual: d_r,
        });
    }
    if n_p == 0 {
        return Err(TrainError::InvalidInput(
            "contrastive loss needs at least one pair".to_string(),
        ));
    }

    let p = autocast(&l2_normalize(passages)?, precision)
        .map_err(|e| TrainError::tensor("autocast passages", e))?;
    let r = autocast(&l2_normalize(reviews)?, precision)
        .map_err(|e| TrainError::tensor("autocast reviews", e))?;

    let cosine = p
        .matmul(&r.t().map_err(|e| TrainError::tensor("transpose reviews", e))?)
        .and_then(|s| s.to_dtype(DType::F32))
        .map_err(|e| TrainError::tensor("similarity matmul", e))?;

    cosine
        .broadcast_mul(logit_scale)
        .map_err(|e| TrainError::tensor("apply logit scale", e))
}

/// Cast normalized rows to the matmul dtype for `precision`.
///
/// The CPU backend has no BF16 matmul, so there the rows are rounded
/// through BF16 and multiplied in f32.
fn autocast(x: &Tensor, precision: Precision) -> candle_core::Result<Tensor> {
    if !precision.is_reduced() {
        return Ok(x.clone());
    }
    let reduced = x.to_dtype(precision.dtype())?;
    if precision == Precision::Bf16 && x.device().is_cpu() {
        return reduced.to_dtype(DType::F32);
    }
    Ok(reduced)
}

/// Symmetric cross-entropy loss and forward accuracy.
///
/// # Errors
/// - `TrainError::DimensionMismatch` if P and R differ in N or D
/// - `TrainError::InvalidInput` if N is zero
pub fn contrastive_loss(
    passages: &Tensor,
    reviews: &Tensor,
    logit_scale: &Tensor,
    precision: Precision,
) -> TrainResult<ContrastiveOutput> {
    let logits = similarity_logits(passages, reviews, logit_scale, precision)?;
    let loss = symmetric_cross_entropy(&logits)?;
    let forward_acc = forward_accuracy(&logits)?;
    Ok(ContrastiveOutput { loss, forward_acc })
}

/// Mean of row-wise and column-wise cross-entropy against the diagonal.
pub fn symmetric_cross_entropy(logits: &Tensor) -> TrainResult<Tensor> {
    let n = logits
        .dim(0)
        .map_err(|e| TrainError::tensor("logits rows", e))?;
    let labels = Tensor::arange(0u32, n as u32, logits.device())
        .map_err(|e| TrainError::tensor("diagonal labels", e))?;

    let forward = candle_nn::loss::cross_entropy(logits, &labels)
        .map_err(|e| TrainError::tensor("forward cross entropy", e))?;
    let transposed = logits
        .t()
        .and_then(|t| t.contiguous())
        .map_err(|e| TrainError::tensor("transpose logits", e))?;
    let backward = candle_nn::loss::cross_entropy(&transposed, &labels)
        .map_err(|e| TrainError::tensor("backward cross entropy", e))?;

    (forward + backward)
        .and_then(|l| l.affine(0.5, 0.0))
        .map_err(|e| TrainError::tensor("average loss", e))
}

/// Fraction of rows i with `argmax_j S[i][j] == i`.
pub fn forward_accuracy(logits: &Tensor) -> TrainResult<f32> {
    diagonal_hits(logits, 1)
}

/// Fraction of columns j with `argmax_i S[i][j] == j`.
pub fn backward_accuracy(logits: &Tensor) -> TrainResult<f32> {
    diagonal_hits(logits, 0)
}

fn diagonal_hits(logits: &Tensor, dim: usize) -> TrainResult<f32> {
    let best: Vec<u32> = logits
        .argmax(dim)
        .and_then(|a| a.to_vec1())
        .map_err(|e| TrainError::tensor("similarity argmax", e))?;
    if best.is_empty() {
        return Ok(0.0);
    }
    let hits = best
        .iter()
        .enumerate()
        .filter(|&(i, &j)| i == j as usize)
        .count();
    Ok(hits as f32 / best.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn make_test_vecs(n: usize, d: usize, phase: f32) -> Tensor {
        let data: Vec<f32> = (0..n * d)
            .map(|i| (i as f32 * 0.37 + phase).sin())
            .collect();
        Tensor::from_slice(&data, (n, d), &Device::Cpu).unwrap()
    }

    fn scale(value: f32) -> Tensor {
        Tensor::from_slice(&[value], 1, &Device::Cpu).unwrap()
    }

    fn loss_value(p: &Tensor, r: &Tensor, s: f32, precision: Precision) -> f32 {
        contrastive_loss(p, r, &scale(s), precision)
            .unwrap()
            .loss_value()
            .unwrap()
    }

    #[test]
    fn test_loss_positive_and_finite() {
        let p = make_test_vecs(6, 8, 0.0);
        let r = make_test_vecs(6, 8, 1.3);
        let value = loss_value(&p, &r, 14.0, Precision::F32);
        assert!(value.is_finite() && value > 0.0, "loss = {}", value);
    }

    #[test]
    fn test_symmetric_in_arguments() {
        let p = make_test_vecs(5, 7, 0.2);
        let r = make_test_vecs(5, 7, 2.1);
        let forward = loss_value(&p, &r, 10.0, Precision::F32);
        let swapped = loss_value(&r, &p, 10.0, Precision::F32);
        assert!((forward - swapped).abs() < 1e-5);
    }

    #[test]
    fn test_identical_orthogonal_sets() {
        let eye = Tensor::eye(4, DType::F32, &Device::Cpu).unwrap();
        let out = contrastive_loss(&eye, &eye, &scale(100.0), Precision::F32).unwrap();
        assert_eq!(out.forward_acc, 1.0);
        // off-diagonal logits are 0, diagonal 100: loss ≈ 3·e^-100
        assert!(out.loss_value().unwrap() < 1e-6);
    }

    #[test]
    fn test_uniform_similarity_loss_is_log_n() {
        let ones = Tensor::ones((4, 3), DType::F32, &Device::Cpu).unwrap();
        let value = loss_value(&ones, &ones, 1.0, Precision::F32);
        assert!((value - 4.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_accuracy_bounds() {
        for n in 1..6 {
            let p = make_test_vecs(n, 4, 0.5);
            let r = make_test_vecs(n, 4, 0.9);
            let out = contrastive_loss(&p, &r, &scale(3.0), Precision::F32).unwrap();
            assert!((0.0..=1.0).contains(&out.forward_acc));
        }
    }

    #[test]
    fn test_backward_accuracy_uses_columns() {
        // row 0 prefers column 1, but column 0 still prefers row 0
        let logits = Tensor::from_slice(&[2.0f32, 3.0, 0.0, 4.0], (2, 2), &Device::Cpu).unwrap();
        assert_eq!(forward_accuracy(&logits).unwrap(), 0.5);
        assert_eq!(backward_accuracy(&logits).unwrap(), 1.0);
    }

    #[test]
    fn test_mismatched_batch_rejected() {
        let p = make_test_vecs(3, 4, 0.0);
        let r = make_test_vecs(2, 4, 0.0);
        assert!(matches!(
            contrastive_loss(&p, &r, &scale(1.0), Precision::F32),
            Err(TrainError::DimensionMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_reduced_precision_close_to_f32() {
        let p = make_test_vecs(8, 16, 0.1);
        let r = make_test_vecs(8, 16, 0.7);
        let full = loss_value(&p, &r, 14.0, Precision::F32);
        for precision in [Precision::F16, Precision::Bf16] {
            let reduced = loss_value(&p, &r, 14.0, precision);
            assert!(
                (full - reduced).abs() < 0.1,
                "{:?}: {} vs {}",
                precision,
                reduced,
                full
            );
        }
    }

    #[test]
    fn test_bf16_on_cpu_rounds_inputs() {
        let p = make_test_vecs(4, 8, 0.3);
        let r = make_test_vecs(4, 8, 1.1);
        let logits = similarity_logits(&p, &r, &scale(1.0), Precision::Bf16).unwrap();
        assert_eq!(logits.dtype(), DType::F32);

        let rounded = |t: &Tensor| {
            l2_normalize(t)
                .unwrap()
                .to_dtype(DType::BF16)
                .unwrap()
                .to_dtype(DType::F32)
                .unwrap()
        };
        let expected = similarity_logits(&rounded(&p), &rounded(&r), &scale(1.0), Precision::F32).unwrap();
        let diff: f32 = (logits - expected)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        // renormalizing the rounded rows moves them by at most bf16 epsilon
        assert!(diff < 2e-2, "diff = {}", diff);
    }

    #[test]
    fn test_bf16_gradient_flows() {
        use candle_core::Var;
        let p = Var::from_tensor(&make_test_vecs(3, 4, 0.0)).unwrap();
        let r = Var::from_tensor(&make_test_vecs(3, 4, 1.0)).unwrap();
        let out = contrastive_loss(p.as_tensor(), r.as_tensor(), &scale(5.0), Precision::Bf16).unwrap();
        let grads = out.loss.backward().unwrap();
        let g: Vec<Vec<f32>> = grads.get(p.as_tensor()).unwrap().to_vec2().unwrap();
        assert!(g.iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn test_gradient_reaches_both_inputs() {
        use candle_core::Var;
        let p = Var::from_tensor(&make_test_vecs(3, 4, 0.0)).unwrap();
        let r = Var::from_tensor(&make_test_vecs(3, 4, 1.0)).unwrap();
        let out = contrastive_loss(p.as_tensor(), r.as_tensor(), &scale(5.0), Precision::F32).unwrap();
        let grads = out.loss.backward().unwrap();
        assert!(grads.get(p.as_tensor()).is_some());
        assert!(grads.get(r.as_tensor()).is_some());
    }
}
