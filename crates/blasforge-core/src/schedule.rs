//! Splitting a batch into scratch-budgeted sub-batches.

use std::ops::Range;

use crate::error::{BuildError, Result};

/// Split items into contiguous sub-batches whose summed scratch fits `budget`.
///
/// Greedy in input order: items accumulate into the current sub-batch until
/// the next one would push the total past the budget. An item that exceeds
/// the budget by itself cannot be placed and fails the whole split.
pub fn split_sub_batches(scratch_sizes: &[u64], budget: u64) -> Result<Vec<Range<usize>>> {
    let mut sub_batches = Vec::new();
    let mut start = 0;
    let mut used = 0u64;

    for (item, &required) in scratch_sizes.iter().enumerate() {
        if required > budget {
            return Err(BuildError::UnsatisfiableScratchBudget {
                item,
                required,
                budget,
            });
        }

        if item > start && used.saturating_add(required) > budget {
            sub_batches.push(start..item);
            start = item;
            used = 0;
        }
        used += required;
    }

    if start < scratch_sizes.len() {
        sub_batches.push(start..scratch_sizes.len());
    }

    Ok(sub_batches)
}

/// Scratch bytes needed by one sub-batch (regions are packed back-to-back).
pub fn sub_batch_scratch(scratch_sizes: &[u64], range: Range<usize>) -> u64 {
    scratch_sizes[range].iter().sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_split_preserves_order() {
        let split = split_sub_batches(&[10, 10, 10], 25).unwrap();
        assert_eq!(split, vec![0..2, 2..3]);
    }

    #[test]
    fn everything_fits_in_one() {
        let split = split_sub_batches(&[10, 10, 10], 30).unwrap();
        assert_eq!(split, vec![0..3]);
    }

    #[test]
    fn each_item_alone() {
        let split = split_sub_batches(&[20, 20, 20], 25).unwrap();
        assert_eq!(split, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn oversized_item_is_rejected() {
        let err = split_sub_batches(&[10, 30, 10], 25).unwrap_err();
        match err {
            BuildError::UnsatisfiableScratchBudget {
                item,
                required,
                budget,
            } => {
                assert_eq!(item, 1);
                assert_eq!(required, 30);
                assert_eq!(budget, 25);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_scratch_items_share_a_sub_batch() {
        let split = split_sub_batches(&[0, 0, 5, 0], 5).unwrap();
        assert_eq!(split, vec![0..4]);
    }

    #[test]
    fn empty_batch_has_no_sub_batches() {
        assert!(split_sub_batches(&[], 10).unwrap().is_empty());
    }

    #[test]
    fn scratch_per_sub_batch() {
        let sizes = [10, 10, 10];
        assert_eq!(sub_batch_scratch(&sizes, 0..2), 20);
        assert_eq!(sub_batch_scratch(&sizes, 2..3), 10);
    }
}
