//! Tokenized batches fed to the encoder towers.

use candle_core::{DType, Device, Tensor};

use crate::error::{TrainError, TrainResult};
use crate::training::partition::MicrobatchGroup;

/// Token ids and attention mask for N examples.
///
/// `tokens` is `[N, L]` u32 and `mask` is `[N, L]` f32 (1.0 for real tokens,
/// 0.0 for padding).
#[derive(Debug, Clone)]
pub struct TokenBatch {
    tokens: Tensor,
    mask: Tensor,
}

impl TokenBatch {
    /// Build a batch from token and mask tensors of equal `[N, L]` shape.
    ///
    /// The mask is converted to f32; tokens to u32.
    pub fn new(tokens: Tensor, mask: Tensor) -> TrainResult<Self> {
        let (n, l) = tokens
            .dims2()
            .map_err(|e| TrainError::tensor("TokenBatch tokens must be [N, L]", e))?;
        let (mask_n, mask_l) = mask
            .dims2()
            .map_err(|e| TrainError::tensor("TokenBatch mask must be [N, L]", e))?;

        if mask_n != n {
            return Err(TrainError::DimensionMismatch {
                expected: n,
                actual: mask_n,
            });
        }
        if mask_l != l {
            return Err(TrainError::DimensionMismatch {
                expected: l,
                actual: mask_l,
            });
        }

        let tokens = tokens
            .to_dtype(DType::U32)
            .map_err(|e| TrainError::tensor("TokenBatch tokens to u32", e))?;
        let mask = mask
            .to_dtype(DType::F32)
            .map_err(|e| TrainError::tensor("TokenBatch mask to f32", e))?;

        Ok(Self { tokens, mask })
    }

    /// Build a batch from padded host rows.
    ///
    /// All rows of `tokens` and `mask` must have the same length.
    pub fn from_rows(tokens: &[Vec<u32>], mask: &[Vec<u32>], device: &Device) -> TrainResult<Self> {
        if tokens.len() != mask.len() {
            return Err(TrainError::DimensionMismatch {
                expected: tokens.len(),
                actual: mask.len(),
            });
        }
        if tokens.is_empty() {
            return Err(TrainError::InvalidInput(
                "TokenBatch requires at least one row".to_string(),
            ));
        }

        let seq_len = tokens[0].len();
        for row in tokens.iter().chain(mask.iter()) {
            if row.len() != seq_len {
                return Err(TrainError::DimensionMismatch {
                    expected: seq_len,
                    actual: row.len(),
                });
            }
        }

        let n = tokens.len();
        let flat_tokens: Vec<u32> = tokens.iter().flatten().copied().collect();
        let flat_mask: Vec<f32> = mask.iter().flatten().map(|&m| m as f32).collect();

        let tokens = Tensor::from_vec(flat_tokens, (n, seq_len), device)
            .map_err(|e| TrainError::tensor("TokenBatch tokens from host", e))?;
        let mask = Tensor::from_vec(flat_mask, (n, seq_len), device)
            .map_err(|e| TrainError::tensor("TokenBatch mask from host", e))?;

        Ok(Self { tokens, mask })
    }

    /// Number of examples (N).
    pub fn len(&self) -> usize {
        self.tokens.dims()[0]
    }

    /// Whether the batch holds no examples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence length (L).
    pub fn seq_len(&self) -> usize {
        self.tokens.dims()[1]
    }

    /// Token ids `[N, L]`.
    pub fn tokens(&self) -> &Tensor {
        &self.tokens
    }

    /// Attention mask `[N, L]`.
    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    /// Rows belonging to one microbatch group.
    pub fn select(&self, group: &MicrobatchGroup) -> TrainResult<Self> {
        if group.start() + group.len() > self.len() {
            return Err(TrainError::InvalidInput(format!(
                "microbatch {:?} out of range for batch of {}",
                group.indices(),
                self.len()
            )));
        }

        let tokens = self
            .tokens
            .narrow(0, group.start(), group.len())
            .map_err(|e| TrainError::tensor("TokenBatch narrow tokens", e))?;
        let mask = self
            .mask
            .narrow(0, group.start(), group.len())
            .map_err(|e| TrainError::tensor("TokenBatch narrow mask", e))?;

        Ok(Self { tokens, mask })
    }

    /// Split into one batch per group, preserving group order.
    pub fn split(&self, groups: &[MicrobatchGroup]) -> TrainResult<Vec<Self>> {
        groups.iter().map(|group| self.select(group)).collect()
    }
}
