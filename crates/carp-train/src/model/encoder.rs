//! Base sequence encoder with pooling.
//!
//! # Architecture
//!
//! ```text
//! tokens [B, L] ──> token_embedding + position_embedding ──> h0 [B, L, H]
//!                                                              │
//!                             h0 + GELU(h0 @ W_ff + b_ff) ──> layer_norm ──> h [B, L, H]
//!                                                              │
//!                                          pooling (EncoderKind) + mask ──> [B, H]
//! ```
//!
//! Weights come from `<model_path>/model.safetensors` when a path is given,
//! otherwise from a seeded initialisation.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::batch::TokenBatch;
use crate::config::{EncoderArch, EncoderKind};
use crate::error::{TrainError, TrainResult};

use super::ops::{constant_var, layer_norm, linear, xavier_var};

/// File name of base weights inside `model_path`.
pub const ENCODER_WEIGHT_FILE: &str = "model.safetensors";

/// Tensor names expected in [`ENCODER_WEIGHT_FILE`].
pub const TOKEN_EMBEDDING: &str = "embeddings.token";
pub const POSITION_EMBEDDING: &str = "embeddings.position";
pub const FF_WEIGHT: &str = "ff.weight";
pub const FF_BIAS: &str = "ff.bias";
pub const LN_WEIGHT: &str = "layer_norm.weight";
pub const LN_BIAS: &str = "layer_norm.bias";

/// Minimum mask sum used as mean-pool denominator.
const MIN_TOKEN_COUNT: f64 = 1e-9;

/// Trainable weights of the base encoder.
#[derive(Debug)]
struct BaseEncoderWeights {
    /// Token embeddings: [vocab_size, hidden_size]
    token_embedding: Var,
    /// Position embeddings: [max_positions, hidden_size]
    position_embedding: Var,
    /// Feed-forward weight: [hidden_size, hidden_size]
    ff_weight: Var,
    /// Feed-forward bias: [hidden_size]
    ff_bias: Var,
    /// Output LayerNorm weight: [hidden_size]
    ln_weight: Var,
    /// Output LayerNorm bias: [hidden_size]
    ln_bias: Var,
}

impl BaseEncoderWeights {
    fn initialize(arch: &EncoderArch, device: &Device, seed: u64) -> TrainResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let h = arch.hidden_size;

        Ok(Self {
            token_embedding: xavier_var(arch.vocab_size, h, &mut rng, device)?,
            position_embedding: xavier_var(arch.max_positions, h, &mut rng, device)?,
            ff_weight: xavier_var(h, h, &mut rng, device)?,
            ff_bias: constant_var(&[h], 0.0, device)?,
            ln_weight: constant_var(&[h], 1.0, device)?,
            ln_bias: constant_var(&[h], 0.0, device)?,
        })
    }

    fn load(model_dir: &Path, arch: &EncoderArch, device: &Device) -> TrainResult<Self> {
        let path = model_dir.join(ENCODER_WEIGHT_FILE);
        if !path.exists() {
            return Err(TrainError::WeightLoad {
                path,
                message: "weight file not found".to_string(),
            });
        }

        let tensors = candle_core::safetensors::load(&path, device).map_err(|e| {
            TrainError::WeightLoad {
                path: path.clone(),
                message: e.to_string(),
            }
        })?;

        let h = arch.hidden_size;
        let take = |name: &str, shape: &[usize]| -> TrainResult<Var> {
            take_var(&tensors, name, shape, &path)
        };

        let weights = Self {
            token_embedding: take(TOKEN_EMBEDDING, &[arch.vocab_size, h])?,
            position_embedding: take(POSITION_EMBEDDING, &[arch.max_positions, h])?,
            ff_weight: take(FF_WEIGHT, &[h, h])?,
            ff_bias: take(FF_BIAS, &[h])?,
            ln_weight: take(LN_WEIGHT, &[h])?,
            ln_bias: take(LN_BIAS, &[h])?,
        };

        tracing::info!(
            "Loaded encoder weights from {} (vocab={}, hidden={})",
            path.display(),
            arch.vocab_size,
            h
        );
        Ok(weights)
    }

    fn vars(&self) -> Vec<Var> {
        vec![
            self.token_embedding.clone(),
            self.position_embedding.clone(),
            self.ff_weight.clone(),
            self.ff_bias.clone(),
            self.ln_weight.clone(),
            self.ln_bias.clone(),
        ]
    }
}

fn take_var(
    tensors: &HashMap<String, Tensor>,
    name: &str,
    shape: &[usize],
    path: &Path,
) -> TrainResult<Var> {
    let tensor = tensors.get(name).ok_or_else(|| TrainError::WeightLoad {
        path: path.to_path_buf(),
        message: format!("missing tensor '{}'", name),
    })?;

    if tensor.dims() != shape {
        return Err(TrainError::WeightLoad {
            path: path.to_path_buf(),
            message: format!(
                "tensor '{}' has shape {:?}, expected {:?}",
                name,
                tensor.dims(),
                shape
            ),
        });
    }

    let tensor = tensor
        .to_dtype(DType::F32)
        .map_err(|e| TrainError::tensor("encoder weight dtype", e))?;
    Var::from_tensor(&tensor).map_err(|e| TrainError::tensor("encoder weight var", e))
}

/// Sequence encoder producing one vector per example.
#[derive(Debug)]
pub struct TextEncoder {
    kind: EncoderKind,
    arch: EncoderArch,
    weights: BaseEncoderWeights,
}

impl TextEncoder {
    /// Construct an encoder of the given kind.
    ///
    /// Loads `<model_path>/model.safetensors` when `model_path` is set;
    /// otherwise initialises from `seed`.
    ///
    /// # Errors
    /// - `TrainError::Config` if `arch` is invalid
    /// - `TrainError::WeightLoad` if the weight file is missing or malformed
    pub fn new(
        kind: EncoderKind,
        model_path: Option<&Path>,
        arch: EncoderArch,
        device: &Device,
        seed: u64,
    ) -> TrainResult<Self> {
        arch.validate()
            .map_err(|message| TrainError::Config { message })?;

        let weights = match model_path {
            Some(dir) => BaseEncoderWeights::load(dir, &arch, device)?,
            None => BaseEncoderWeights::initialize(&arch, device, seed)?,
        };

        Ok(Self {
            kind,
            arch,
            weights,
        })
    }

    /// Pooling kind.
    pub fn kind(&self) -> EncoderKind {
        self.kind
    }

    /// Output width (hidden size).
    pub fn d_model(&self) -> usize {
        self.arch.hidden_size
    }

    /// Trainable parameters.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.weights.vars()
    }

    /// Encode a batch to `[B, hidden_size]`.
    pub fn encode(&self, batch: &TokenBatch) -> TrainResult<Tensor> {
        let states = self.token_states(batch)?;
        self.pool(&states, batch.mask())
    }

    /// Per-token hidden states `[B, L, H]`.
    fn token_states(&self, batch: &TokenBatch) -> TrainResult<Tensor> {
        let (b, l) = (batch.len(), batch.seq_len());
        let h = self.arch.hidden_size;

        if l > self.arch.max_positions {
            return Err(TrainError::InvalidInput(format!(
                "sequence length {} exceeds max_positions {}",
                l, self.arch.max_positions
            )));
        }

        let ids = batch
            .tokens()
            .flatten_all()
            .map_err(|e| TrainError::tensor("encoder flatten ids", e))?;
        let max_id = ids
            .max(0)
            .and_then(|m| m.to_scalar::<u32>())
            .map_err(|e| TrainError::tensor("encoder max id", e))?;
        if max_id as usize >= self.arch.vocab_size {
            return Err(TrainError::InvalidInput(format!(
                "token id {} out of vocabulary ({})",
                max_id, self.arch.vocab_size
            )));
        }

        let token_emb = self
            .weights
            .token_embedding
            .as_tensor()
            .index_select(&ids, 0)
            .and_then(|t| t.reshape((b, l, h)))
            .map_err(|e| TrainError::tensor("encoder token embedding", e))?;

        let positions = self
            .weights
            .position_embedding
            .as_tensor()
            .narrow(0, 0, l)
            .map_err(|e| TrainError::tensor("encoder position embedding", e))?;

        let h0 = token_emb
            .broadcast_add(&positions)
            .map_err(|e| TrainError::tensor("encoder add positions", e))?;

        let ff = linear(
            &h0,
            self.weights.ff_weight.as_tensor(),
            Some(self.weights.ff_bias.as_tensor()),
        )?
        .gelu()
        .map_err(|e| TrainError::tensor("encoder gelu", e))?;

        let residual = (h0 + ff).map_err(|e| TrainError::tensor("encoder residual", e))?;

        layer_norm(
            &residual,
            self.weights.ln_weight.as_tensor(),
            self.weights.ln_bias.as_tensor(),
            self.arch.layer_norm_eps,
        )
    }

    fn pool(&self, states: &Tensor, mask: &Tensor) -> TrainResult<Tensor> {
        match self.kind {
            EncoderKind::Sum => masked_sum(states, mask),
            EncoderKind::MeanPool => {
                let summed = masked_sum(states, mask)?;
                let counts = mask
                    .sum_keepdim(1)
                    .and_then(|c| c.maximum(MIN_TOKEN_COUNT))
                    .map_err(|e| TrainError::tensor("mean pool counts", e))?;
                summed
                    .broadcast_div(&counts)
                    .map_err(|e| TrainError::tensor("mean pool divide", e))
            }
            EncoderKind::EndOfText => {
                let selector = last_token_selector(mask)?;
                masked_sum(states, &selector)
            }
            EncoderKind::Direct => states
                .narrow(1, 0, 1)
                .and_then(|t| t.squeeze(1))
                .map_err(|e| TrainError::tensor("direct pool", e)),
        }
    }
}

/// Sum of token states weighted by `weights` `[B, L]`.
fn masked_sum(states: &Tensor, weights: &Tensor) -> TrainResult<Tensor> {
    let w = weights
        .unsqueeze(2)
        .map_err(|e| TrainError::tensor("masked sum unsqueeze", e))?;
    states
        .broadcast_mul(&w)
        .and_then(|t| t.sum(1))
        .map_err(|e| TrainError::tensor("masked sum", e))
}

/// One-hot `[B, L]` selecting the last unmasked position of each row
/// (position 0 for fully masked rows).
fn last_token_selector(mask: &Tensor) -> TrainResult<Tensor> {
    let rows: Vec<Vec<f32>> = mask
        .to_vec2()
        .map_err(|e| TrainError::tensor("eot mask to host", e))?;
    let (b, l) = (rows.len(), rows.first().map_or(0, Vec::len));

    let mut selector = vec![0.0f32; b * l];
    for (i, row) in rows.iter().enumerate() {
        let last = row.iter().rposition(|&m| m > 0.0).unwrap_or(0);
        if l > 0 {
            selector[i * l + last] = 1.0;
        }
    }

    Tensor::from_vec(selector, (b, l), mask.device())
        .map_err(|e| TrainError::tensor("eot selector", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arch() -> EncoderArch {
        EncoderArch {
            vocab_size: 20,
            hidden_size: 8,
            max_positions: 6,
            layer_norm_eps: 1e-5,
        }
    }

    fn encoder(kind: EncoderKind) -> TextEncoder {
        TextEncoder::new(kind, None, arch(), &Device::Cpu, 11).unwrap()
    }

    fn batch(tokens: &[Vec<u32>], mask: &[Vec<u32>]) -> TokenBatch {
        TokenBatch::from_rows(tokens, mask, &Device::Cpu).unwrap()
    }

    fn rows(t: &Tensor) -> Vec<Vec<f32>> {
        t.to_vec2().unwrap()
    }

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_output_shape_per_kind() {
        let b = batch(&[vec![1, 2, 3], vec![4, 5, 0]], &[vec![1, 1, 1], vec![1, 1, 0]]);
        for kind in [
            EncoderKind::Sum,
            EncoderKind::MeanPool,
            EncoderKind::EndOfText,
            EncoderKind::Direct,
        ] {
            let out = encoder(kind).encode(&b).unwrap();
            assert_eq!(out.dims(), &[2, 8], "{:?}", kind);
        }
    }

    #[test]
    fn test_mean_pool_ignores_padding() {
        let enc = encoder(EncoderKind::MeanPool);
        let padded_a = batch(&[vec![3, 4, 7]], &[vec![1, 1, 0]]);
        let padded_b = batch(&[vec![3, 4, 19]], &[vec![1, 1, 0]]);
        let a = rows(&enc.encode(&padded_a).unwrap());
        let b = rows(&enc.encode(&padded_b).unwrap());
        assert!(close(&a[0], &b[0]), "padding token changed pooled output");
    }

    #[test]
    fn test_eot_selects_last_real_token() {
        let enc = encoder(EncoderKind::EndOfText);
        let states = enc
            .token_states(&batch(&[vec![3, 4, 7]], &[vec![1, 1, 0]]))
            .unwrap();
        let pooled = enc
            .encode(&batch(&[vec![3, 4, 7]], &[vec![1, 1, 0]]))
            .unwrap();
        let expected = states.narrow(1, 1, 1).unwrap().squeeze(1).unwrap();
        assert!(close(&rows(&pooled)[0], &rows(&expected)[0]));
    }

    #[test]
    fn test_direct_selects_first_token() {
        let enc = encoder(EncoderKind::Direct);
        let b = batch(&[vec![5, 6]], &[vec![1, 1]]);
        let states = enc.token_states(&b).unwrap();
        let expected = states.narrow(1, 0, 1).unwrap().squeeze(1).unwrap();
        assert!(close(&rows(&enc.encode(&b).unwrap())[0], &rows(&expected)[0]));
    }

    #[test]
    fn test_sum_is_count_times_mean() {
        let b = batch(&[vec![1, 2, 3, 4]], &[vec![1, 1, 1, 1]]);
        let sum = rows(&encoder(EncoderKind::Sum).encode(&b).unwrap());
        let mean = rows(&encoder(EncoderKind::MeanPool).encode(&b).unwrap());
        let scaled: Vec<f32> = mean[0].iter().map(|v| v * 4.0).collect();
        assert!(close(&sum[0], &scaled));
    }

    #[test]
    fn test_sequence_too_long_rejected() {
        let b = batch(&[vec![1; 7]], &[vec![1; 7]]);
        assert!(matches!(
            encoder(EncoderKind::MeanPool).encode(&b),
            Err(TrainError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_token_out_of_vocab_rejected() {
        let b = batch(&[vec![1, 25]], &[vec![1, 1]]);
        assert!(encoder(EncoderKind::MeanPool).encode(&b).is_err());
    }

    #[test]
    fn test_seeds_differ() {
        let b = batch(&[vec![1, 2]], &[vec![1, 1]]);
        let a = TextEncoder::new(EncoderKind::MeanPool, None, arch(), &Device::Cpu, 1).unwrap();
        let c = TextEncoder::new(EncoderKind::MeanPool, None, arch(), &Device::Cpu, 2).unwrap();
        assert!(!close(
            &rows(&a.encode(&b).unwrap())[0],
            &rows(&c.encode(&b).unwrap())[0]
        ));
    }

    #[test]
    fn test_load_from_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let a = arch();
        let source = encoder(EncoderKind::MeanPool);

        let names = [
            TOKEN_EMBEDDING,
            POSITION_EMBEDDING,
            FF_WEIGHT,
            FF_BIAS,
            LN_WEIGHT,
            LN_BIAS,
        ];
        let tensors: HashMap<String, Tensor> = names
            .iter()
            .zip(source.trainable_vars())
            .map(|(n, v)| (n.to_string(), v.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, dir.path().join(ENCODER_WEIGHT_FILE)).unwrap();

        let loaded =
            TextEncoder::new(EncoderKind::MeanPool, Some(dir.path()), a, &device, 999).unwrap();
        let b = batch(&[vec![1, 2, 3]], &[vec![1, 1, 1]]);
        assert!(close(
            &rows(&source.encode(&b).unwrap())[0],
            &rows(&loaded.encode(&b).unwrap())[0]
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = TextEncoder::new(EncoderKind::Sum, Some(dir.path()), arch(), &Device::Cpu, 0)
            .unwrap_err();
        assert!(matches!(err, TrainError::WeightLoad { .. }));
    }

    #[test]
    fn test_load_wrong_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut tensors = HashMap::new();
        tensors.insert(
            TOKEN_EMBEDDING.to_string(),
            Tensor::zeros((3, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, dir.path().join(ENCODER_WEIGHT_FILE)).unwrap();

        let err = TextEncoder::new(EncoderKind::Sum, Some(dir.path()), arch(), &Device::Cpu, 0)
            .unwrap_err();
        match err {
            TrainError::WeightLoad { message, .. } => assert!(message.contains("shape")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
