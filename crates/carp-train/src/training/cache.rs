//! Detached embedding caches built before the gradient pass.

use candle_core::Tensor;

use crate::batch::TokenBatch;
use crate::error::{TrainError, TrainResult};
use crate::model::{CarpModel, Tower};

/// Ordered detached embeddings, one entry per microbatch group.
///
/// Immutable once built. Concatenating the entries in order reconstructs the
/// full batch in example order.
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    entries: Vec<Tensor>,
}

impl EmbeddingCache {
    /// Build a cache from embeddings, detaching each one.
    pub fn from_detached(entries: Vec<Tensor>) -> Self {
        Self {
            entries: entries.into_iter().map(|t| t.detach()).collect(),
        }
    }

    /// Encode every microbatch through `tower` and keep the detached results.
    pub fn build(tower: &Tower, microbatches: &[TokenBatch]) -> TrainResult<Self> {
        let entries = microbatches
            .iter()
            .map(|mb| tower.encode(mb).map(|t| t.detach()))
            .collect::<TrainResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Tensor> {
        self.entries.get(index)
    }

    /// Number of cached examples across all entries.
    pub fn num_examples(&self) -> usize {
        self.entries.iter().map(|t| t.dims()[0]).sum()
    }

    /// Full `[N, D]` batch in example order.
    pub fn concat(&self) -> TrainResult<Tensor> {
        concat_rows(self.entries.iter().collect())
    }

    /// View with entry `index` replaced by `live`.
    ///
    /// The cache itself is untouched, so every substitution starts from the
    /// cached values.
    ///
    /// # Errors
    /// - `TrainError::InvalidInput` if `index` is out of range
    /// - `TrainError::DimensionMismatch` if `live` has a different row count
    pub fn substitute(&self, index: usize, live: Tensor) -> TrainResult<CacheView<'_>> {
        let cached = self.entries.get(index).ok_or_else(|| {
            TrainError::InvalidInput(format!(
                "cache index {} out of range for {} entries",
                index,
                self.entries.len()
            ))
        })?;

        let (cached_rows, live_rows) = (cached.dims()[0], live.dims().first().copied().unwrap_or(0));
        if cached_rows != live_rows {
            return Err(TrainError::DimensionMismatch {
                expected: cached_rows,
                actual: live_rows,
            });
        }

        Ok(CacheView {
            cache: self,
            index,
            live,
        })
    }
}

/// Cache entries with one position replaced by a live embedding.
#[derive(Debug)]
pub struct CacheView<'a> {
    cache: &'a EmbeddingCache,
    index: usize,
    live: Tensor,
}

impl CacheView<'_> {
    /// Full `[N, D]` batch; only the substituted rows carry gradient history.
    pub fn concat(&self) -> TrainResult<Tensor> {
        let parts = self
            .cache
            .entries
            .iter()
            .enumerate()
            .map(|(i, t)| if i == self.index { &self.live } else { t })
            .collect();
        concat_rows(parts)
    }
}

fn concat_rows(parts: Vec<&Tensor>) -> TrainResult<Tensor> {
    if parts.is_empty() {
        return Err(TrainError::InvalidInput(
            "cannot concatenate an empty cache".to_string(),
        ));
    }
    Tensor::cat(&parts, 0).map_err(|e| TrainError::tensor("cache concat", e))
}

impl CarpModel {
    /// Encode every passage and review microbatch without gradient history.
    ///
    /// Both slices must come from the same partition.
    pub fn calculate_embeddings(
        &self,
        passage_mbs: &[TokenBatch],
        review_mbs: &[TokenBatch],
    ) -> TrainResult<(EmbeddingCache, EmbeddingCache)> {
        if passage_mbs.len() != review_mbs.len() {
            return Err(TrainError::DimensionMismatch {
                expected: passage_mbs.len(),
                actual: review_mbs.len(),
            });
        }

        let passages = EmbeddingCache::build(self.passage_tower(), passage_mbs)?;
        let reviews = EmbeddingCache::build(self.review_tower(), review_mbs)?;

        tracing::debug!(
            "Built embedding caches: {} entries, {} examples",
            passages.len(),
            passages.num_examples()
        );
        Ok((passages, reviews))
    }
}
