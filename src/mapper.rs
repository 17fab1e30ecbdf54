//! Mapping of spatial keys between refinement levels and to owning ranks.

use crate::constants::{BITS_PER_LEVEL, DEEPEST_LEVEL};

/// Encode integer coordinates into an interleaved spatial key at the given level.
pub fn encode_key(index: [u64; 3], level: u32) -> u64 {
    assert!(level <= DEEPEST_LEVEL);

    let mut key: u64 = 0;

    for bit in 0..level {
        for (d, &coord) in index.iter().enumerate() {
            key |= ((coord >> bit) & 1) << (BITS_PER_LEVEL * bit + d as u32);
        }
    }

    key
}

/// Decode an interleaved spatial key at the given level into integer coordinates.
pub fn decode_key(key: u64, level: u32) -> [u64; 3] {
    assert!(level <= DEEPEST_LEVEL);

    let mut index = [0u64; 3];

    for bit in 0..level {
        for (d, coord) in index.iter_mut().enumerate() {
            *coord |= ((key >> (BITS_PER_LEVEL * bit + d as u32)) & 1) << bit;
        }
    }

    index
}

/// Strategy for reducing a fine spatial key to its ancestor key.
///
/// The rule is selected when the mapper is configured. `KeyDivision` is the
/// fast path valid for curves whose keys nest across levels. The coordinate
/// rule truncates the decoded coordinates to the ancestor cell size and
/// re-encodes, which works for any interleaved curve.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoarsenRule {
    /// Integer division of the key by the branching factor raised to the level gap.
    KeyDivision,
    /// Truncation of the decoded coordinates followed by re-encoding.
    CoordinateTruncation,
}

/// Maps spatial keys to ancestor keys and to owning ranks.
///
/// Rank ownership is described per level by the smallest key living on each
/// rank, in rank order. A key on level `lv` belongs to rank `i` if
/// `bins[lv][i] <= key < bins[lv][i + 1]`, with the last rank owning all
/// larger keys.
pub struct IndexMapper {
    rule: CoarsenRule,
    rank_bins: Vec<Vec<u64>>,
}

impl IndexMapper {
    /// Create a new mapper from a coarsening rule and per-level rank bins.
    ///
    /// `rank_bins[lv]` must be sorted and have one entry per rank.
    pub fn new(rule: CoarsenRule, rank_bins: Vec<Vec<u64>>) -> Self {
        for bins in &rank_bins {
            assert!(!bins.is_empty());
            assert!(bins.windows(2).all(|pair| pair[0] <= pair[1]));
        }

        Self { rule, rank_bins }
    }

    /// Return the number of levels the mapper knows about.
    pub fn num_levels(&self) -> usize {
        self.rank_bins.len()
    }

    /// Reduce a fine key to the key of its ancestor `level_gap` levels up.
    pub fn coarsen(&self, fine_key: u64, level_gap: u32) -> u64 {
        match self.rule {
            CoarsenRule::KeyDivision => fine_key >> (BITS_PER_LEVEL * level_gap),
            CoarsenRule::CoordinateTruncation => {
                let index = decode_key(fine_key, DEEPEST_LEVEL);
                let truncated = [
                    index[0] >> level_gap,
                    index[1] >> level_gap,
                    index[2] >> level_gap,
                ];
                encode_key(truncated, DEEPEST_LEVEL - level_gap)
            }
        }
    }

    /// Return the rank owning the given key at the given level.
    pub fn owner_rank(&self, level: usize, key: u64) -> usize {
        let bins = &self.rank_bins[level];

        // A binary search either hits the first key of a rank exactly or
        // returns the insertion point, whose predecessor is the owner.
        match bins.binary_search(&key) {
            Ok(rank) => rank,
            Err(0) => panic!(
                "key {} at level {} precedes the first rank bin {}",
                key, level, bins[0]
            ),
            Err(rank) => rank - 1,
        }
    }
}
