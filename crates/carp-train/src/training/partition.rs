//! Deterministic microbatch partitioning.
//!
//! The same partition is applied to the passage and review batches of a step,
//! so group `i` names the same examples in both towers' caches.

use std::ops::Range;

use crate::error::{TrainError, TrainResult};

/// Contiguous run of example positions processed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicrobatchGroup {
    range: Range<usize>,
}

impl MicrobatchGroup {
    /// First example position.
    pub fn start(&self) -> usize {
        self.range.start
    }

    /// Number of examples in the group.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Whether the group is empty. Groups from [`generate_indices`] never are.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Example positions in ascending order.
    pub fn indices(&self) -> Range<usize> {
        self.range.clone()
    }
}

/// Split `[0, n)` into ordered groups of at most `microbatch_size` positions.
///
/// No shuffling: group order and membership depend only on `n` and
/// `microbatch_size`. The final group is shorter when `n` is not a multiple of
/// `microbatch_size`. `n == 0` yields an empty partition.
///
/// # Errors
/// `TrainError::Config` if `microbatch_size` is zero.
pub fn generate_indices(n: usize, microbatch_size: usize) -> TrainResult<Vec<MicrobatchGroup>> {
    if microbatch_size == 0 {
        return Err(TrainError::Config {
            message: "microbatch_size must be greater than 0".to_string(),
        });
    }

    Ok((0..n)
        .step_by(microbatch_size)
        .map(|start| MicrobatchGroup {
            range: start..(start + microbatch_size).min(n),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_split() {
        let groups = generate_indices(4, 2).unwrap();
        let indices: Vec<Vec<usize>> = groups.iter().map(|g| g.indices().collect()).collect();
        assert_eq!(indices, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_uneven_split_short_tail() {
        let groups = generate_indices(5, 2).unwrap();
        let sizes: Vec<usize> = groups.iter().map(MicrobatchGroup::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(groups[2].start(), 4);
    }

    #[test]
    fn test_empty_batch() {
        assert!(generate_indices(0, 4).unwrap().is_empty());
    }

    #[test]
    fn test_zero_microbatch_rejected() {
        assert!(matches!(
            generate_indices(8, 0),
            Err(TrainError::Config { .. })
        ));
    }

    #[test]
    fn test_single_group_when_microbatch_covers_batch() {
        let groups = generate_indices(3, 8).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].indices(), 0..3);
    }

    #[test]
    fn test_partition_coverage() {
        for n in 0..40 {
            for m in 1..12 {
                let groups = generate_indices(n, m).unwrap();
                let flat: Vec<usize> = groups.iter().flat_map(|g| g.indices()).collect();
                assert_eq!(flat, (0..n).collect::<Vec<_>>(), "n={} m={}", n, m);
                assert!(groups.iter().all(|g| !g.is_empty() && g.len() <= m));
                assert_eq!(groups.len(), n.div_ceil(m));
            }
        }
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(generate_indices(17, 5).unwrap(), generate_indices(17, 5).unwrap());
    }
}
