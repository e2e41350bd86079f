//! Parameter update rules over an explicit gradient buffer.

use candle_core::{DType, Tensor, Var};

use crate::config::OptimizerConfig;
use crate::error::{TrainError, TrainResult};

use super::gradients::GradientAccumulator;

/// Parameter update rule owning the gradient buffer of its parameters.
pub trait Optimizer {
    /// Gradient buffer of the tracked parameters.
    fn gradients(&self) -> &GradientAccumulator;

    fn gradients_mut(&mut self) -> &mut GradientAccumulator;

    /// Apply one update from the current gradients.
    fn step(&mut self) -> TrainResult<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Tracked parameters.
    fn params(&self) -> &[Var] {
        self.gradients().vars()
    }

    fn zero_grad(&mut self) {
        self.gradients_mut().zero();
    }
}

/// First and second moment estimates of one parameter.
#[derive(Debug)]
struct MomentState {
    m: Tensor,
    v: Tensor,
    step: i32,
}

/// Adam with decoupled weight decay.
///
/// ```text
/// θ ← θ·(1 − lr·λ)
/// m ← β1·m + (1 − β1)·g
/// v ← β2·v + (1 − β2)·g²
/// θ ← θ − lr · m̂ / (√v̂ + ε)
/// ```
///
/// Parameters without a gradient this step are left untouched, including
/// their decay and moment state.
#[derive(Debug)]
pub struct AdamW {
    config: OptimizerConfig,
    grads: GradientAccumulator,
    states: Vec<Option<MomentState>>,
}

impl AdamW {
    pub fn new(vars: Vec<Var>, config: OptimizerConfig) -> TrainResult<Self> {
        config
            .validate()
            .map_err(|message| TrainError::Config { message })?;
        let states = vars.iter().map(|_| None).collect();
        Ok(Self {
            config,
            grads: GradientAccumulator::new(vars),
            states,
        })
    }

    /// Register another parameter.
    pub fn add_param(&mut self, var: Var) -> TrainResult<()> {
        if var.dtype() != DType::F32 {
            return Err(TrainError::InvalidInput(format!(
                "optimizer parameters must be f32, got {:?}",
                var.dtype()
            )));
        }
        self.grads.add_var(var);
        self.states.push(None);
        Ok(())
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }
}

impl Optimizer for AdamW {
    fn gradients(&self) -> &GradientAccumulator {
        &self.grads
    }

    fn gradients_mut(&mut self) -> &mut GradientAccumulator {
        &mut self.grads
    }

    fn step(&mut self) -> TrainResult<()> {
        let OptimizerConfig {
            learning_rate: lr,
            weight_decay,
            beta1,
            beta2,
            eps,
        } = self.config;
        let map = |e| TrainError::tensor("adamw update", e);

        for (var, state) in self.grads.vars().iter().zip(self.states.iter_mut()) {
            let Some(grad) = self.grads.get(var) else {
                continue;
            };

            if state.is_none() {
                *state = Some(MomentState {
                    m: grad.zeros_like().map_err(map)?,
                    v: grad.zeros_like().map_err(map)?,
                    step: 0,
                });
            }
            let Some(state) = state.as_mut() else {
                continue;
            };
            state.step += 1;

            state.m = ((&state.m * beta1).map_err(map)? + (grad * (1.0 - beta1)).map_err(map)?)
                .map_err(map)?;
            state.v = ((&state.v * beta2).map_err(map)?
                + (grad.sqr().map_err(map)? * (1.0 - beta2)).map_err(map)?)
            .map_err(map)?;

            let m_hat = (&state.m / (1.0 - beta1.powi(state.step))).map_err(map)?;
            let v_hat = (&state.v / (1.0 - beta2.powi(state.step))).map_err(map)?;
            let update = m_hat
                .div(&(v_hat.sqrt().map_err(map)? + eps).map_err(map)?)
                .map_err(map)?;

            let theta = var.as_tensor();
            let decayed = (theta * (1.0 - lr * weight_decay)).map_err(map)?;
            let next = (decayed - (update * lr).map_err(map)?).map_err(map)?;
            var.set(&next).map_err(map)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }
}

/// Plain gradient descent.
#[derive(Debug)]
pub struct Sgd {
    learning_rate: f64,
    grads: GradientAccumulator,
}

impl Sgd {
    pub fn new(vars: Vec<Var>, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            grads: GradientAccumulator::new(vars),
        }
    }
}

impl Optimizer for Sgd {
    fn gradients(&self) -> &GradientAccumulator {
        &self.grads
    }

    fn gradients_mut(&mut self) -> &mut GradientAccumulator {
        &mut self.grads
    }

    fn step(&mut self) -> TrainResult<()> {
        for var in self.grads.vars() {
            if let Some(grad) = self.grads.get(var) {
                let next = (grad * self.learning_rate)
                    .and_then(|g| var.as_tensor() - g)
                    .map_err(|e| TrainError::tensor("sgd update", e))?;
                var.set(&next)
                    .map_err(|e| TrainError::tensor("sgd update", e))?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap()).unwrap()
    }

    fn values(v: &Var) -> Vec<f32> {
        v.as_tensor().to_vec1().unwrap()
    }

    fn set_grad<O: Optimizer>(opt: &mut O, v: &Var, g: &[f32]) {
        opt.gradients_mut()
            .set(v, Tensor::from_slice(g, g.len(), &Device::Cpu).unwrap());
    }

    #[test]
    fn test_adamw_first_step_moves_by_lr() {
        let v = var(&[1.0, -1.0]);
        let config = OptimizerConfig {
            learning_rate: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut opt = AdamW::new(vec![v.clone()], config).unwrap();
        set_grad(&mut opt, &v, &[2.0, -3.0]);
        opt.step().unwrap();

        // bias-corrected first step is lr * sign(g)
        let after = values(&v);
        assert!((after[0] - 0.9).abs() < 1e-5);
        assert!((after[1] + 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_adamw_decoupled_decay() {
        let v = var(&[2.0]);
        let config = OptimizerConfig {
            learning_rate: 0.1,
            weight_decay: 0.5,
            ..Default::default()
        };
        let mut opt = AdamW::new(vec![v.clone()], config).unwrap();
        set_grad(&mut opt, &v, &[0.0]);
        opt.step().unwrap();
        // 2 · (1 − 0.05), zero gradient contributes nothing
        assert!((values(&v)[0] - 1.9).abs() < 1e-5);
    }

    #[test]
    fn test_adamw_skips_params_without_grad() {
        let a = var(&[1.0]);
        let b = var(&[1.0]);
        let mut opt = AdamW::new(vec![a.clone(), b.clone()], OptimizerConfig::default()).unwrap();
        set_grad(&mut opt, &a, &[1.0]);
        opt.step().unwrap();
        assert_ne!(values(&a), vec![1.0]);
        assert_eq!(values(&b), vec![1.0]);
    }

    #[test]
    fn test_zero_grad_and_params() {
        let a = var(&[1.0]);
        let mut opt = AdamW::new(vec![a.clone()], OptimizerConfig::default()).unwrap();
        set_grad(&mut opt, &a, &[1.0]);
        opt.zero_grad();
        assert!(opt.gradients().is_empty());
        assert_eq!(opt.params().len(), 1);
    }

    #[test]
    fn test_learning_rate_roundtrip() {
        let mut opt = Sgd::new(vec![var(&[0.0])], 0.1);
        opt.set_learning_rate(0.01);
        assert_eq!(opt.learning_rate(), 0.01);
    }

    #[test]
    fn test_sgd_step() {
        let v = var(&[1.0, 2.0]);
        let mut opt = Sgd::new(vec![v.clone()], 0.5);
        set_grad(&mut opt, &v, &[1.0, -2.0]);
        opt.step().unwrap();
        assert_eq!(values(&v), vec![0.5, 3.0]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = OptimizerConfig {
            beta1: 1.0,
            ..Default::default()
        };
        assert!(AdamW::new(vec![], config).is_err());
    }
}
