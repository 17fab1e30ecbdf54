//! Utility routines.

use num::traits::Zero;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Return the permutation that sorts the array.
pub fn argsort<T: Ord + Copy>(arr: &[T]) -> Vec<usize> {
    let mut sort_indices = (0..arr.len()).collect::<Vec<_>>();
    sort_indices.sort_unstable_by_key(|&index| arr[index]);
    sort_indices
}

/// Reorder an array according to a permutation.
pub fn reorder<T: Copy>(arr: &[T], permutation: &[usize]) -> Vec<T> {
    let mut reordered = Vec::<T>::with_capacity(arr.len());
    for &index in permutation.iter() {
        reordered.push(arr[index]);
    }
    reordered
}

/// Resolve each query key against a sorted reference list.
///
/// Returns for each query the position of the key within `sorted_reference`,
/// or `None` if the key does not occur. Duplicate queries resolve to the
/// same position.
pub fn match_sorted_keys<T: Ord>(sorted_reference: &[T], queries: &[T]) -> Vec<Option<usize>> {
    queries
        .iter()
        .map(|key| sorted_reference.binary_search(key).ok())
        .collect()
}

/// Compute exclusive prefix sums of an array of counts.
///
/// For the counts `[3, 4, 5]` the result is `[0, 3, 7]`. This gives the
/// starting offset of each bucket within a concatenated buffer.
pub fn exclusive_prefix_sums<T: Zero + Copy + std::ops::Add<Output = T>>(counts: &[T]) -> Vec<T> {
    counts
        .iter()
        .scan(T::zero(), |acc, &x| {
            let tmp = *acc;
            *acc = *acc + x;
            Some(tmp)
        })
        .collect()
}

/// Get a seeded rng.
pub fn seeded_rng(seed: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed as u64)
}

/// Generate uniformly random positions within the unit cube for testing.
pub fn generate_random_positions<R: Rng>(npositions: usize, rng: &mut R) -> Vec<[f64; 3]> {
    let mut positions = Vec::<[f64; 3]>::with_capacity(npositions);

    for _ in 0..npositions {
        positions.push([rng.gen(), rng.gen(), rng.gen()]);
    }

    positions
}
