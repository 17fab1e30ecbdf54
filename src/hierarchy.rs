//! The per-level patch forest and halo correspondence tables.

use crate::geometry::PatchExtent;
use crate::particles::ParticleId;
use crate::tools::{argsort, reorder};

/// A single patch of the refinement hierarchy.
///
/// A patch is a leaf if it has no child link. Leaf patches own their
/// particles directly. A non-leaf patch may still carry particles
/// temporarily while they wait for their velocity correction.
pub struct Patch {
    key: u64,
    extent: PatchExtent,
    child: Option<usize>,
    particles: Vec<ParticleId>,
}

impl Patch {
    /// Create a new leaf patch from its spatial key and extent.
    pub fn new(key: u64, extent: PatchExtent) -> Self {
        Self {
            key,
            extent,
            child: None,
            particles: Vec::new(),
        }
    }

    /// Attach the id of the patch's first child on the next level.
    pub fn with_child(mut self, child: usize) -> Self {
        self.child = Some(child);
        self
    }

    /// Return the spatial key.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Return the spatial extent.
    pub fn extent(&self) -> &PatchExtent {
        &self.extent
    }

    /// Return true if the patch has no children.
    pub fn is_leaf(&self) -> bool {
        self.child.is_none()
    }

    /// Return the locally owned particle ids.
    pub fn particles(&self) -> &[ParticleId] {
        &self.particles
    }

    /// Return the number of locally owned particles.
    pub fn particle_count(&self) -> i32 {
        self.particles.len() as i32
    }

    /// Replace the locally owned particle list.
    pub fn assign_particles(&mut self, particles: Vec<ParticleId>) {
        self.particles = particles;
    }
}

/// All patches of one refinement level.
///
/// Real patches come first, followed by buffer patches shadowing patches
/// owned by other ranks. A sorted table of the real patch keys together with
/// the sorting permutation supports matching received keys against patches.
pub struct PatchLevel {
    patches: Vec<Patch>,
    num_real: usize,
    sorted_real_keys: Vec<u64>,
    sorted_real_ids: Vec<usize>,
}

impl PatchLevel {
    /// Create a level from its real and buffer patches.
    pub fn new(real: Vec<Patch>, buffer: Vec<Patch>) -> Self {
        let num_real = real.len();

        let real_keys = real.iter().map(|patch| patch.key()).collect::<Vec<_>>();
        let permutation = argsort(&real_keys);
        let sorted_real_keys = reorder(&real_keys, &permutation);

        let mut patches = real;
        patches.extend(buffer);

        Self {
            patches,
            num_real,
            sorted_real_keys,
            sorted_real_ids: permutation,
        }
    }

    /// Return the number of real patches.
    pub fn num_real(&self) -> usize {
        self.num_real
    }

    /// Return the total number of patches including buffer patches.
    pub fn num_total(&self) -> usize {
        self.patches.len()
    }

    /// Return a patch by id.
    pub fn patch(&self, id: usize) -> &Patch {
        &self.patches[id]
    }

    /// Return a mutable patch by id.
    pub fn patch_mut(&mut self, id: usize) -> &mut Patch {
        &mut self.patches[id]
    }

    /// Iterate over the real patches together with their ids.
    pub fn real_patches(&self) -> impl Iterator<Item = (usize, &Patch)> {
        self.patches[..self.num_real].iter().enumerate()
    }

    /// Return the sorted keys of the real patches.
    pub fn sorted_real_keys(&self) -> &[u64] {
        &self.sorted_real_keys
    }

    /// Return the patch id belonging to a position within the sorted key table.
    pub fn real_id_at_sorted(&self, sorted_position: usize) -> usize {
        self.sorted_real_ids[sorted_position]
    }
}

/// Correspondence between local buffer patches and their owning real patches.
///
/// The table is precomputed externally. Both patch id lists are grouped by
/// peer rank: `real_patches` lists the local real patches whose data is sent
/// out, grouped by destination rank with `real_counts_per_rank` entries per
/// rank, and `buffer_patches` lists the local buffer patches receiving data,
/// grouped by source rank. The ordering within each rank group must agree
/// between the sending and the receiving side.
#[derive(Clone, Default)]
pub struct HaloExchangeMap {
    /// Local buffer patch ids grouped by source rank.
    pub buffer_patches: Vec<usize>,
    /// Number of buffer patches received from each rank.
    pub buffer_counts_per_rank: Vec<i32>,
    /// Local real patch ids grouped by destination rank.
    pub real_patches: Vec<usize>,
    /// Number of real patches sent to each rank.
    pub real_counts_per_rank: Vec<i32>,
}

impl HaloExchangeMap {
    /// Create a table with no correspondences for `num_ranks` ranks.
    pub fn empty(num_ranks: usize) -> Self {
        Self {
            buffer_patches: Vec::new(),
            buffer_counts_per_rank: vec![0; num_ranks],
            real_patches: Vec::new(),
            real_counts_per_rank: vec![0; num_ranks],
        }
    }
}

/// The halo correspondence tables of one level.
#[derive(Clone)]
pub struct LevelHaloMaps {
    /// Sibling-buffer patches at the level itself.
    pub sibling: HaloExchangeMap,
    /// Father-sibling-buffer patches at the level below.
    pub father_sibling: HaloExchangeMap,
}

/// The distributed patch hierarchy of the local rank.
pub struct Hierarchy {
    levels: Vec<PatchLevel>,
    halo_maps: Vec<LevelHaloMaps>,
}

impl Hierarchy {
    /// Create a hierarchy from its levels with empty halo tables.
    pub fn new(levels: Vec<PatchLevel>, num_ranks: usize) -> Self {
        let halo_maps = levels
            .iter()
            .map(|_| LevelHaloMaps {
                sibling: HaloExchangeMap::empty(num_ranks),
                father_sibling: HaloExchangeMap::empty(num_ranks),
            })
            .collect();

        Self { levels, halo_maps }
    }

    /// Return the number of levels.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Return the maximum level.
    pub fn max_level(&self) -> usize {
        self.levels.len() - 1
    }

    /// Return a level.
    pub fn level(&self, level: usize) -> &PatchLevel {
        &self.levels[level]
    }

    /// Return a mutable level.
    pub fn level_mut(&mut self, level: usize) -> &mut PatchLevel {
        &mut self.levels[level]
    }

    /// Return the halo tables of a level.
    pub fn halo_maps(&self, level: usize) -> &LevelHaloMaps {
        &self.halo_maps[level]
    }

    /// Replace the halo tables of a level.
    pub fn set_halo_maps(&mut self, level: usize, maps: LevelHaloMaps) {
        self.halo_maps[level] = maps;
    }
}
