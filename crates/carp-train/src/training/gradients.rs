//! Accumulate-only gradient buffer.
//!
//! Every `backward()` call yields a fresh `GradStore`, so gradients from the
//! 2·K backward passes of a gradient-cached step are summed here, keyed by
//! parameter id.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, TensorId, Var};

use crate::error::{TrainError, TrainResult};
use crate::model::ops::scalar_f32;

/// Added to the norm before computing the clip coefficient.
const CLIP_EPS: f64 = 1e-6;

/// Summed gradients for a fixed set of parameters.
#[derive(Debug)]
pub struct GradientAccumulator {
    vars: Vec<Var>,
    grads: HashMap<TensorId, Tensor>,
    backward_passes: usize,
}

impl GradientAccumulator {
    pub fn new(vars: Vec<Var>) -> Self {
        Self {
            vars,
            grads: HashMap::new(),
            backward_passes: 0,
        }
    }

    /// Tracked parameters in registration order.
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Track one more parameter.
    pub fn add_var(&mut self, var: Var) {
        self.vars.push(var);
    }

    /// Backward passes folded in since the last [`zero`](Self::zero).
    pub fn backward_passes(&self) -> usize {
        self.backward_passes
    }

    /// Drop all accumulated gradients.
    pub fn zero(&mut self) {
        self.grads.clear();
        self.backward_passes = 0;
    }

    /// Add the gradients of one backward pass for every tracked parameter.
    ///
    /// Parameters absent from `store` are left unchanged.
    pub fn accumulate(&mut self, store: &GradStore) -> TrainResult<()> {
        for var in &self.vars {
            let Some(grad) = store.get(var.as_tensor()) else {
                continue;
            };
            let id = var.as_tensor().id();
            let summed = match self.grads.remove(&id) {
                Some(existing) => (existing + grad)
                    .map_err(|e| TrainError::tensor("accumulate gradient", e))?,
                None => grad.detach(),
            };
            self.grads.insert(id, summed);
        }
        self.backward_passes += 1;
        Ok(())
    }

    /// Accumulated gradient of `var`, if any pass touched it.
    pub fn get(&self, var: &Var) -> Option<&Tensor> {
        self.grads.get(&var.as_tensor().id())
    }

    /// Replace the gradient of `var`.
    pub fn set(&mut self, var: &Var, grad: Tensor) {
        self.grads.insert(var.as_tensor().id(), grad);
    }

    /// Number of parameters holding a gradient.
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Multiply every gradient by `factor`.
    pub fn scale_by(&mut self, factor: f64) -> TrainResult<()> {
        for grad in self.grads.values_mut() {
            *grad = grad
                .affine(factor, 0.0)
                .map_err(|e| TrainError::tensor("scale gradient", e))?;
        }
        Ok(())
    }

    /// L2 norm over all gradients taken together.
    pub fn global_norm(&self) -> TrainResult<f64> {
        let mut total = 0.0f64;
        for grad in self.grads.values() {
            let sq = grad
                .sqr()
                .and_then(|s| s.sum_all())
                .map_err(|e| TrainError::tensor("gradient norm", e))?;
            total += scalar_f32(&sq)? as f64;
        }
        Ok(total.sqrt())
    }

    /// Rescale so the global norm is at most `max_norm`.
    ///
    /// Returns the norm measured before clipping.
    pub fn clip_global_norm(&mut self, max_norm: f64) -> TrainResult<f64> {
        if !(max_norm > 0.0 && max_norm.is_finite()) {
            return Err(TrainError::Config {
                message: format!("clip threshold must be positive, got {}", max_norm),
            });
        }
        let norm = self.global_norm()?;
        let coef = max_norm / (norm + CLIP_EPS);
        if coef < 1.0 {
            self.scale_by(coef)?;
        }
        Ok(norm)
    }

    /// Whether every accumulated gradient element is finite.
    pub fn all_finite(&self) -> TrainResult<bool> {
        for grad in self.grads.values() {
            let values: Vec<f32> = grad
                .flatten_all()
                .and_then(|g| g.to_vec1())
                .map_err(|e| TrainError::tensor("gradient finiteness", e))?;
            if values.iter().any(|v| !v.is_finite()) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap()).unwrap()
    }

    fn grad_of(acc: &GradientAccumulator, v: &Var) -> Vec<f32> {
        acc.get(v).unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_accumulate_sums_passes() {
        let a = var(&[1.0, 2.0]);
        let mut acc = GradientAccumulator::new(vec![a.clone()]);

        for _ in 0..3 {
            let loss = a.as_tensor().sum_all().unwrap();
            acc.accumulate(&loss.backward().unwrap()).unwrap();
        }

        assert_eq!(acc.backward_passes(), 3);
        assert_eq!(grad_of(&acc, &a), vec![3.0, 3.0]);
    }

    #[test]
    fn test_untouched_var_has_no_grad() {
        let a = var(&[1.0]);
        let b = var(&[1.0]);
        let mut acc = GradientAccumulator::new(vec![a.clone(), b.clone()]);
        let loss = a.as_tensor().sqr().unwrap().sum_all().unwrap();
        acc.accumulate(&loss.backward().unwrap()).unwrap();
        assert!(acc.get(&b).is_none());
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn test_zero_clears() {
        let a = var(&[1.0]);
        let mut acc = GradientAccumulator::new(vec![a.clone()]);
        acc.accumulate(&a.as_tensor().sum_all().unwrap().backward().unwrap())
            .unwrap();
        acc.zero();
        assert!(acc.is_empty());
        assert_eq!(acc.backward_passes(), 0);
    }

    #[test]
    fn test_clip_global_norm() {
        let a = var(&[0.0, 0.0]);
        let b = var(&[0.0]);
        let mut acc = GradientAccumulator::new(vec![a.clone(), b.clone()]);
        acc.set(&a, Tensor::from_slice(&[3.0f32, 0.0], 2, &Device::Cpu).unwrap());
        acc.set(&b, Tensor::from_slice(&[4.0f32], 1, &Device::Cpu).unwrap());

        let norm = acc.clip_global_norm(1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((acc.global_norm().unwrap() - 1.0).abs() < 1e-5);
        assert!((grad_of(&acc, &a)[0] - 0.6).abs() < 1e-5);
    }

    #[test]
    fn test_clip_rejects_non_positive_threshold() {
        let a = var(&[0.0]);
        let mut acc = GradientAccumulator::new(vec![a.clone()]);
        acc.set(&a, Tensor::from_slice(&[2.0f32], 1, &Device::Cpu).unwrap());
        for bad in [0.0, -0.5, f64::NAN] {
            assert!(matches!(
                acc.clip_global_norm(bad),
                Err(TrainError::Config { .. })
            ));
        }
        assert_eq!(grad_of(&acc, &a), vec![2.0]);
    }

    #[test]
    fn test_clip_leaves_small_norm() {
        let a = var(&[0.0]);
        let mut acc = GradientAccumulator::new(vec![a.clone()]);
        acc.set(&a, Tensor::from_slice(&[0.5f32], 1, &Device::Cpu).unwrap());
        acc.clip_global_norm(1.0).unwrap();
        assert_eq!(grad_of(&acc, &a), vec![0.5]);
    }

    #[test]
    fn test_all_finite() {
        let a = var(&[0.0, 0.0]);
        let mut acc = GradientAccumulator::new(vec![a.clone()]);
        acc.set(&a, Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap());
        assert!(acc.all_finite().unwrap());
        acc.set(&a, Tensor::from_slice(&[1.0f32, f32::INFINITY], 2, &Device::Cpu).unwrap());
        assert!(!acc.all_finite().unwrap());
    }
}
