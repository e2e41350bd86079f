//! Learned logit scale (inverse temperature) with a fixed clamp.

use candle_core::{Device, Tensor, Var};

use crate::error::{TrainError, TrainResult};

use super::ops::{constant_var, scalar_f32};

/// Lower clamp bound of the log scale: `ln(1/100)`.
pub const LOGIT_SCALE_MIN: f64 = -4.605_170_185_988_091;

/// Upper clamp bound of the log scale: `ln(100)`.
pub const LOGIT_SCALE_MAX: f64 = 4.605_170_185_988_091;

/// Learned log logit scale.
///
/// Stored unconstrained; every read goes through
/// `exp(clamp(value, LOGIT_SCALE_MIN, LOGIT_SCALE_MAX))`, so the effective
/// multiplier on cosine similarities stays within `[1/100, 100]`.
#[derive(Debug, Clone)]
pub struct LogitScale {
    value: Var,
}

impl LogitScale {
    /// Initialise at `ln(1 / temperature)`.
    pub fn new(temperature: f64, device: &Device) -> TrainResult<Self> {
        if !(temperature > 0.0 && temperature.is_finite()) {
            return Err(TrainError::InvalidInput(format!(
                "temperature must be positive and finite, got {}",
                temperature
            )));
        }
        let value = constant_var(&[1], (1.0 / temperature).ln() as f32, device)?;
        Ok(Self { value })
    }

    /// Underlying trainable parameter `[1]`.
    pub fn var(&self) -> &Var {
        &self.value
    }

    /// Effective multiplier `[1]`.
    ///
    /// With `track_grad == false` the result is detached from the parameter.
    pub fn scale(&self, track_grad: bool) -> TrainResult<Tensor> {
        let raw = if track_grad {
            self.value.as_tensor().clone()
        } else {
            self.value.as_tensor().detach()
        };

        raw.clamp(LOGIT_SCALE_MIN, LOGIT_SCALE_MAX)
            .and_then(|t| t.exp())
            .map_err(|e| TrainError::tensor("logit scale clamp/exp", e))
    }

    /// Raw, unclamped stored value.
    pub fn raw_value(&self) -> TrainResult<f32> {
        scalar_f32(self.value.as_tensor())
    }

    /// Effective multiplier as a host value.
    pub fn effective_scale(&self) -> TrainResult<f32> {
        scalar_f32(&self.scale(false)?)
    }

    /// Overwrite the stored value (tests and weight surgery).
    pub fn set_raw_value(&self, value: f32) -> TrainResult<()> {
        let t = Tensor::from_vec(vec![value], 1, self.value.device())
            .map_err(|e| TrainError::tensor("logit scale set", e))?;
        self.value
            .set(&t)
            .map_err(|e| TrainError::tensor("logit scale set", e))
    }
}
