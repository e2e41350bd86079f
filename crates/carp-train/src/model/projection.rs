//! Projection from encoder width into the shared latent space.

use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;

use crate::error::{TrainError, TrainResult};

use super::ops::{constant_var, layer_norm, linear, xavier_var};

/// Layer norm epsilon of the MLP projection.
const PROJECTION_LN_EPS: f64 = 1e-5;

/// Maps `[m, in_dim]` encoder output to `[m, latent_dim]`.
#[derive(Debug)]
pub enum ProjectionLayer {
    /// `x @ W`, no bias.
    Linear { weight: Var },
    /// `p = x @ W1; h = GELU(p) @ W2; layer_norm(h + p)`.
    Mlp {
        w1: Var,
        w2: Var,
        ln_weight: Var,
        ln_bias: Var,
    },
}

impl ProjectionLayer {
    /// Bias-free linear projection.
    pub fn linear(in_dim: usize, latent_dim: usize, rng: &mut StdRng, device: &Device) -> TrainResult<Self> {
        Ok(Self::Linear {
            weight: xavier_var(in_dim, latent_dim, rng, device)?,
        })
    }

    /// Two-layer GELU projection with residual and layer norm.
    pub fn mlp(in_dim: usize, latent_dim: usize, rng: &mut StdRng, device: &Device) -> TrainResult<Self> {
        Ok(Self::Mlp {
            w1: xavier_var(in_dim, latent_dim, rng, device)?,
            w2: xavier_var(latent_dim, latent_dim, rng, device)?,
            ln_weight: constant_var(&[latent_dim], 1.0, device)?,
            ln_bias: constant_var(&[latent_dim], 0.0, device)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> TrainResult<Tensor> {
        match self {
            Self::Linear { weight } => linear(x, weight.as_tensor(), None),
            Self::Mlp {
                w1,
                w2,
                ln_weight,
                ln_bias,
            } => {
                let projected = linear(x, w1.as_tensor(), None)?;
                let activated = projected
                    .gelu()
                    .map_err(|e| TrainError::tensor("projection gelu", e))?;
                let hidden = linear(&activated, w2.as_tensor(), None)?;
                let residual = (hidden + &projected)
                    .map_err(|e| TrainError::tensor("projection residual", e))?;
                layer_norm(
                    &residual,
                    ln_weight.as_tensor(),
                    ln_bias.as_tensor(),
                    PROJECTION_LN_EPS,
                )
            }
        }
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        match self {
            Self::Linear { weight } => vec![weight.clone()],
            Self::Mlp {
                w1,
                w2,
                ln_weight,
                ln_bias,
            } => vec![w1.clone(), w2.clone(), ln_weight.clone(), ln_bias.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::SeedableRng;

    #[test]
    fn test_output_width() {
        let mut rng = StdRng::seed_from_u64(3);
        let x = Tensor::ones((4, 6), DType::F32, &Device::Cpu).unwrap();
        for layer in [
            ProjectionLayer::linear(6, 10, &mut rng, &Device::Cpu).unwrap(),
            ProjectionLayer::mlp(6, 10, &mut rng, &Device::Cpu).unwrap(),
        ] {
            assert_eq!(layer.forward(&x).unwrap().dims(), &[4, 10]);
        }
    }

    #[test]
    fn test_parameter_counts() {
        let mut rng = StdRng::seed_from_u64(3);
        let lin = ProjectionLayer::linear(6, 10, &mut rng, &Device::Cpu).unwrap();
        let mlp = ProjectionLayer::mlp(6, 10, &mut rng, &Device::Cpu).unwrap();
        assert_eq!(lin.trainable_vars().len(), 1);
        assert_eq!(mlp.trainable_vars().len(), 4);
    }

    #[test]
    fn test_linear_has_no_bias() {
        let mut rng = StdRng::seed_from_u64(5);
        let lin = ProjectionLayer::linear(3, 4, &mut rng, &Device::Cpu).unwrap();
        let zeros = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = lin.forward(&zeros).unwrap().to_vec2().unwrap();
        assert!(out.iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn test_input_width_mismatch() {
        let mut rng = StdRng::seed_from_u64(5);
        let mlp = ProjectionLayer::mlp(3, 4, &mut rng, &Device::Cpu).unwrap();
        let x = Tensor::ones((2, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            mlp.forward(&x),
            Err(TrainError::DimensionMismatch { expected: 3, actual: 5 })
        ));
    }
}
