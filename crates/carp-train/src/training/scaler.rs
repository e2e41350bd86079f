//! Dynamic loss scaling for reduced-precision training.
//!
//! Protocol per step: `scale(loss)` before each backward, optional
//! `unscale(grads)` before clipping, `step(optimizer)`, then `update()`.

use candle_core::Tensor;

use crate::config::ScalerConfig;
use crate::error::{TrainError, TrainResult};

use super::gradients::GradientAccumulator;
use super::optimizer::Optimizer;

/// Loss scaler with backoff on overflow and periodic growth.
#[derive(Debug, Clone)]
pub struct GradScaler {
    config: ScalerConfig,
    scale: f64,
    growth_tracker: u32,
    unscaled: bool,
    found_inf: bool,
    stepped: bool,
}

impl GradScaler {
    pub fn new(config: ScalerConfig) -> TrainResult<Self> {
        config
            .validate()
            .map_err(|message| TrainError::Config { message })?;
        Ok(Self {
            scale: config.init_scale,
            config,
            growth_tracker: 0,
            unscaled: false,
            found_inf: false,
            stepped: false,
        })
    }

    /// Scaler that leaves losses and gradients untouched.
    pub fn disabled() -> Self {
        let config = ScalerConfig::disabled();
        Self {
            scale: 1.0,
            config,
            growth_tracker: 0,
            unscaled: false,
            found_inf: false,
            stepped: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Multiplier currently applied to losses (1.0 when disabled).
    pub fn current_scale(&self) -> f64 {
        if self.config.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// Whether the last unscale found a non-finite gradient.
    pub fn found_inf(&self) -> bool {
        self.found_inf
    }

    /// Multiply `loss` by the current scale.
    pub fn scale(&self, loss: &Tensor) -> TrainResult<Tensor> {
        if !self.config.enabled {
            return Ok(loss.clone());
        }
        loss.affine(self.scale, 0.0)
            .map_err(|e| TrainError::tensor("scale loss", e))
    }

    /// Divide accumulated gradients by the current scale and record whether
    /// any element is non-finite.
    ///
    /// # Errors
    /// `TrainError::Scaler` if called twice before [`update`](Self::update).
    pub fn unscale(&mut self, grads: &mut GradientAccumulator) -> TrainResult<()> {
        if !self.config.enabled {
            return Ok(());
        }
        if self.unscaled {
            return Err(TrainError::Scaler {
                message: "unscale called twice before update".to_string(),
            });
        }
        if self.stepped {
            return Err(TrainError::Scaler {
                message: "unscale called after step".to_string(),
            });
        }

        grads.scale_by(1.0 / self.scale)?;
        self.found_inf = !grads.all_finite()?;
        self.unscaled = true;
        Ok(())
    }

    /// Step `optimizer` unless a non-finite gradient was found.
    ///
    /// Unscales first when that has not happened yet this step. Returns
    /// whether the optimizer stepped.
    pub fn step<O: Optimizer + ?Sized>(&mut self, optimizer: &mut O) -> TrainResult<bool> {
        if !self.config.enabled {
            optimizer.step()?;
            return Ok(true);
        }
        if self.stepped {
            return Err(TrainError::Scaler {
                message: "step called twice before update".to_string(),
            });
        }
        if !self.unscaled {
            self.unscale(optimizer.gradients_mut())?;
        }

        if self.found_inf {
            tracing::warn!(
                "Skipping optimizer step: non-finite gradients at loss scale {}",
                self.scale
            );
            self.stepped = true;
            return Ok(false);
        }
        if let Err(err) = optimizer.step() {
            self.discard_step();
            return Err(err);
        }
        self.stepped = true;
        Ok(true)
    }

    /// Drop this step's unscale/step state without touching the scale.
    ///
    /// For callers abandoning a step after an error; the next step starts
    /// clean.
    pub fn discard_step(&mut self) {
        self.unscaled = false;
        self.found_inf = false;
        self.stepped = false;
    }

    /// Adjust the scale from this step's outcome and reset per-step state.
    ///
    /// # Errors
    /// `TrainError::Scaler` if no step was recorded since the last update.
    pub fn update(&mut self) -> TrainResult<()> {
        if !self.config.enabled {
            return Ok(());
        }
        if !self.stepped {
            return Err(TrainError::Scaler {
                message: "update called without a preceding step".to_string(),
            });
        }

        if self.found_inf {
            self.scale *= self.config.backoff_factor;
            self.growth_tracker = 0;
            tracing::debug!("Loss scale backed off to {}", self.scale);
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.config.growth_interval {
                self.scale *= self.config.growth_factor;
                self.growth_tracker = 0;
                tracing::debug!("Loss scale grown to {}", self.scale);
            }
        }

        self.discard_step();
        Ok(())
    }
}
