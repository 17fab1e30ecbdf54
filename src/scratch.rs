//! Round-scoped scratch state of a collection round.

use crate::constants::{ATTR_MASS, ATTR_POS_X, ATTR_POS_Y, ATTR_POS_Z, NUM_ATTRIBUTES, UNSET_COUNT};
use crate::hierarchy::Hierarchy;

/// Collected particle attributes of one patch as four parallel arrays.
pub struct AttributeBuffers {
    mass: Vec<f64>,
    pos_x: Vec<f64>,
    pos_y: Vec<f64>,
    pos_z: Vec<f64>,
}

impl AttributeBuffers {
    /// Create empty buffers sized for `capacity` particles.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            mass: Vec::with_capacity(capacity),
            pos_x: Vec::with_capacity(capacity),
            pos_y: Vec::with_capacity(capacity),
            pos_z: Vec::with_capacity(capacity),
        }
    }

    /// Append one attribute record.
    pub fn push(&mut self, record: [f64; NUM_ATTRIBUTES]) {
        self.mass.push(record[ATTR_MASS]);
        self.pos_x.push(record[ATTR_POS_X]);
        self.pos_y.push(record[ATTR_POS_Y]);
        self.pos_z.push(record[ATTR_POS_Z]);
    }

    /// Return the number of stored particles.
    pub fn len(&self) -> usize {
        self.mass.len()
    }

    /// Return true if no particles are stored.
    pub fn is_empty(&self) -> bool {
        self.mass.is_empty()
    }

    /// Return the masses.
    pub fn mass(&self) -> &[f64] {
        &self.mass
    }

    /// Return the x positions.
    pub fn pos_x(&self) -> &[f64] {
        &self.pos_x
    }

    /// Return the y positions.
    pub fn pos_y(&self) -> &[f64] {
        &self.pos_y
    }

    /// Return the z positions.
    pub fn pos_z(&self) -> &[f64] {
        &self.pos_z
    }

    /// Return the position of the stored particle at `index`.
    pub fn position(&self, index: usize) -> [f64; 3] {
        [self.pos_x[index], self.pos_y[index], self.pos_z[index]]
    }
}

/// The per-patch scratch state populated by a collection round.
///
/// The scratch state is a side table keyed by level and patch id rather than
/// part of the patches themselves, so the "unset vs. populated" invariant is
/// enforceable locally. Counts start at [UNSET_COUNT] and return to it when
/// the round is released. Buffers exist only for patches whose count is
/// positive in a full (not count-only) round.
pub struct CollectScratch {
    counts: Vec<Vec<i32>>,
    buffers: Vec<Vec<Option<AttributeBuffers>>>,
}

impl CollectScratch {
    /// Create unset scratch state covering every patch of the hierarchy.
    pub fn new(hierarchy: &Hierarchy) -> Self {
        let mut counts = Vec::with_capacity(hierarchy.num_levels());
        let mut buffers = Vec::with_capacity(hierarchy.num_levels());

        for level in 0..hierarchy.num_levels() {
            let num_patches = hierarchy.level(level).num_total();
            counts.push(vec![UNSET_COUNT; num_patches]);
            buffers.push((0..num_patches).map(|_| None).collect());
        }

        Self { counts, buffers }
    }

    /// Return the collected count of a patch, or [UNSET_COUNT].
    pub fn count(&self, level: usize, patch: usize) -> i32 {
        self.counts[level][patch]
    }

    /// Return true if the patch has no scratch state in the current round.
    pub fn is_unset(&self, level: usize, patch: usize) -> bool {
        self.counts[level][patch] == UNSET_COUNT && self.buffers[level][patch].is_none()
    }

    /// Return the collected attribute buffers of a patch if allocated.
    pub fn buffers(&self, level: usize, patch: usize) -> Option<&AttributeBuffers> {
        self.buffers[level][patch].as_ref()
    }

    pub(crate) fn set_count(&mut self, level: usize, patch: usize, count: i32) {
        self.counts[level][patch] = count;
    }

    pub(crate) fn add_count(&mut self, level: usize, patch: usize, count: i32) {
        self.counts[level][patch] += count;
    }

    pub(crate) fn insert_buffers(&mut self, level: usize, patch: usize, buffers: AttributeBuffers) {
        self.buffers[level][patch] = Some(buffers);
    }

    pub(crate) fn buffers_mut(&mut self, level: usize, patch: usize) -> &mut AttributeBuffers {
        self.buffers[level][patch]
            .as_mut()
            .unwrap_or_else(|| panic!("buffers not allocated (level {}, patch {})", level, patch))
    }

    /// Reset one patch to the unset state. Freeing an unset patch is a no-op.
    pub fn clear_patch(&mut self, level: usize, patch: usize) {
        self.counts[level][patch] = UNSET_COUNT;
        self.buffers[level][patch] = None;
    }

    /// Release the scratch state of a collection round.
    ///
    /// Frees the buffers and resets the counts of every real patch at
    /// `level`, of the sibling-buffer patches at `level` if requested, and
    /// of the father-sibling-buffer patches at `level - 1` if requested.
    /// Idempotent per patch.
    pub fn release(
        &mut self,
        hierarchy: &Hierarchy,
        level: usize,
        sibling_halo: bool,
        parent_halo: bool,
    ) {
        for patch in 0..hierarchy.level(level).num_real() {
            self.clear_patch(level, patch);
        }

        if sibling_halo {
            let buffer_patches = hierarchy.halo_maps(level).sibling.buffer_patches.clone();
            for patch in buffer_patches {
                self.clear_patch(level, patch);
            }
        }

        if parent_halo && level > 0 {
            let buffer_patches = hierarchy
                .halo_maps(level)
                .father_sibling
                .buffer_patches
                .clone();
            for patch in buffer_patches {
                self.clear_patch(level - 1, patch);
            }
        }
    }
}
