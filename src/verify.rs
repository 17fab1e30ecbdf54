//! Consistency checks wrapping the collector entry points.
//!
//! The checks are enabled through a runtime flag on the collector rather
//! than a compile time switch. Every violation is a bug in the caller or in
//! the partition state and aborts the run.

use crate::constants::{ATTR_MASS, ATTR_POS_X, ATTR_POS_Y, ATTR_POS_Z, NUM_ATTRIBUTES};
use crate::exchange::DataExchange;
use crate::geometry::PatchExtent;
use crate::hierarchy::Hierarchy;
use crate::particles::{ParticleId, ParticleStore};
use crate::scratch::CollectScratch;

/// Find a real patch at `level` that still carries scratch state.
///
/// Used to detect a collection round started without releasing the previous
/// one. Returns the patch id and its count.
pub fn find_initialized_patch(
    hierarchy: &Hierarchy,
    scratch: &CollectScratch,
    level: usize,
) -> Option<(usize, i32)> {
    (0..hierarchy.level(level).num_real())
        .find(|&patch| !scratch.is_unset(level, patch))
        .map(|patch| (patch, scratch.count(level, patch)))
}

/// Assert that no patch strictly deeper than `level` is both non-leaf and particle-bearing.
///
/// Transitional particles are only legal directly at the target level.
pub fn check_deep_patches(hierarchy: &Hierarchy, level: usize) {
    for deep_level in level + 1..hierarchy.num_levels() {
        for (patch_id, patch) in hierarchy.level(deep_level).real_patches() {
            if !patch.is_leaf() && patch.particle_count() > 0 {
                panic!(
                    "non-leaf patch has particles (level {}, patch {}, count {})",
                    deep_level,
                    patch_id,
                    patch.particle_count()
                );
            }
        }
    }
}

/// Assert that a particle is eligible for position prediction.
///
/// Particles collected from levels below the target are never waiting for a
/// velocity correction, so their stored time must be non-negative.
pub fn check_predictable(store: &ParticleStore, id: ParticleId) {
    let time = store.time(id);
    if time < 0.0 {
        panic!("particle {} has negative time {:e} during prediction", id, time);
    }
}

/// Assert that a received attribute record is active and lies within the patch.
///
/// The bounds check only applies when prediction is off; predicted positions
/// may legitimately leave the patch.
pub fn check_received_record(
    record: [f64; NUM_ATTRIBUTES],
    extent: &PatchExtent,
    predict_position: bool,
    level: usize,
    patch: usize,
) {
    if record[ATTR_MASS] < 0.0 {
        panic!(
            "received inactive particle (level {}, patch {}, mass {:e})",
            level, patch, record[ATTR_MASS]
        );
    }

    if !predict_position {
        let pos = [record[ATTR_POS_X], record[ATTR_POS_Y], record[ATTR_POS_Z]];
        if !extent.contains(pos) {
            panic!(
                "received particle outside its patch (level {}, patch {}, pos {:?}, extent {})",
                level, patch, pos, extent
            );
        }
    }
}

/// Assert that a particle residing on a non-leaf patch is transitional.
pub fn check_transitional_time(store: &ParticleStore, id: ParticleId, level: usize, patch: usize) {
    let time = store.time(id);
    if time >= 0.0 {
        panic!(
            "particle {} on non-leaf patch is not transitional (level {}, patch {}, time {:e})",
            id, level, patch, time
        );
    }
}

/// Assert that the round collected every particle at levels `level` and deeper.
///
/// Sums leaf counts and collected counts over the real patches at `level`
/// and compares against the tracked per-level population, both reduced over
/// all ranks. The comparison is collective.
pub fn check_conservation<E: DataExchange>(
    hierarchy: &Hierarchy,
    store: &ParticleStore,
    scratch: &CollectScratch,
    exchange: &E,
    level: usize,
) {
    let mut collected: i64 = 0;

    for (patch_id, patch) in hierarchy.level(level).real_patches() {
        collected += if patch.is_leaf() {
            patch.particle_count() as i64
        } else {
            scratch.count(level, patch_id) as i64
        };
    }

    let collected_all = exchange.sum_over_ranks(collected);
    let expected_all = exchange.sum_over_ranks(store.population_from_level(level));

    if collected_all != expected_all {
        panic!(
            "total number of collected particles at levels >= {} is {} but expected {}",
            level, collected_all, expected_all
        );
    }
}

/// Assert that no patch at `level` or `level - 1` retains scratch state.
///
/// Runs after a release over both real and buffer patches.
pub fn check_released(hierarchy: &Hierarchy, scratch: &CollectScratch, level: usize) {
    let lowest = level.saturating_sub(1);

    for check_level in (lowest..=level).rev() {
        for patch in 0..hierarchy.level(check_level).num_total() {
            if !scratch.is_unset(check_level, patch) {
                panic!(
                    "patch retains scratch state after release (level {}, patch {}, count {})",
                    check_level,
                    patch,
                    scratch.count(check_level, patch)
                );
            }
        }
    }
}
