//! Differentiable tensor building blocks shared by encoders and projections.

use candle_core::{DType, Device, Tensor, Var, D};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{TrainError, TrainResult};

/// Small constant keeping the L2 norm differentiable at zero.
const NORM_EPS: f64 = 1e-12;

/// L2-normalise each row of a `[N, D]` tensor.
pub fn l2_normalize(x: &Tensor) -> TrainResult<Tensor> {
    let norm = x
        .sqr()
        .and_then(|s| s.sum_keepdim(D::Minus1))
        .and_then(|s| s.affine(1.0, NORM_EPS))
        .and_then(|s| s.sqrt())
        .map_err(|e| TrainError::tensor("l2_normalize norm", e))?;

    x.broadcast_div(&norm)
        .map_err(|e| TrainError::tensor("l2_normalize divide", e))
}

/// Layer normalisation over the last dimension.
pub fn layer_norm(x: &Tensor, weight: &Tensor, bias: &Tensor, eps: f64) -> TrainResult<Tensor> {
    let mean = x
        .mean_keepdim(D::Minus1)
        .map_err(|e| TrainError::tensor("layer_norm mean", e))?;
    let centered = x
        .broadcast_sub(&mean)
        .map_err(|e| TrainError::tensor("layer_norm center", e))?;
    let std = centered
        .sqr()
        .and_then(|v| v.mean_keepdim(D::Minus1))
        .and_then(|v| v.affine(1.0, eps))
        .and_then(|v| v.sqrt())
        .map_err(|e| TrainError::tensor("layer_norm variance", e))?;

    centered
        .broadcast_div(&std)
        .and_then(|n| n.broadcast_mul(weight))
        .and_then(|n| n.broadcast_add(bias))
        .map_err(|e| TrainError::tensor("layer_norm affine", e))
}

/// Apply `x @ weight (+ bias)` to a tensor whose last dimension is the input
/// width. Leading dimensions are flattened for the matmul and restored.
pub fn linear(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> TrainResult<Tensor> {
    let dims = x.dims().to_vec();
    let in_dim = *dims
        .last()
        .ok_or_else(|| TrainError::InvalidInput("linear input must have rank >= 1".into()))?;
    let (w_in, w_out) = weight
        .dims2()
        .map_err(|e| TrainError::tensor("linear weight must be [in, out]", e))?;

    if in_dim != w_in {
        return Err(TrainError::DimensionMismatch {
            expected: w_in,
            actual: in_dim,
        });
    }

    let rows: usize = dims[..dims.len() - 1].iter().product();
    let flat = x
        .reshape((rows, in_dim))
        .map_err(|e| TrainError::tensor("linear flatten", e))?;
    let mut out = flat
        .matmul(weight)
        .map_err(|e| TrainError::tensor("linear matmul", e))?;

    if let Some(bias) = bias {
        out = out
            .broadcast_add(bias)
            .map_err(|e| TrainError::tensor("linear bias", e))?;
    }

    let mut out_dims = dims;
    if let Some(last) = out_dims.last_mut() {
        *last = w_out;
    }
    out.reshape(out_dims)
        .map_err(|e| TrainError::tensor("linear restore shape", e))
}

/// Trainable `[rows, cols]` matrix with Xavier-uniform values from `rng`.
pub fn xavier_var(rows: usize, cols: usize, rng: &mut StdRng, device: &Device) -> TrainResult<Var> {
    let bound = (6.0 / (rows + cols) as f64).sqrt() as f32;
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    var_from_vec(data, &[rows, cols], device)
}

/// Trainable tensor filled with `value`.
pub fn constant_var(shape: &[usize], value: f32, device: &Device) -> TrainResult<Var> {
    let tensor = Tensor::ones(shape, DType::F32, device)
        .and_then(|t| t.affine(value as f64, 0.0))
        .map_err(|e| TrainError::tensor("constant parameter", e))?;
    Var::from_tensor(&tensor).map_err(|e| TrainError::tensor("constant parameter var", e))
}

/// Trainable tensor from host data.
pub fn var_from_vec(data: Vec<f32>, shape: &[usize], device: &Device) -> TrainResult<Var> {
    let tensor = Tensor::from_vec(data, shape, device)
        .map_err(|e| TrainError::tensor("parameter from host", e))?;
    Var::from_tensor(&tensor).map_err(|e| TrainError::tensor("parameter var", e))
}

/// Read a rank-0 or single-element tensor as f32.
pub fn scalar_f32(t: &Tensor) -> TrainResult<f32> {
    let flat = t
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| TrainError::tensor("read scalar", e))?;
    flat.first()
        .copied()
        .ok_or_else(|| TrainError::InvalidInput("expected a single-element tensor".into()))
}
