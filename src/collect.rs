//! Collection of particles from all descendants onto patches at one target level.

use itertools::izip;

use crate::constants::{ATTR_MASS, ATTR_POS_X, ATTR_POS_Y, ATTR_POS_Z, NUM_ATTRIBUTES};
use crate::exchange::DataExchange;
use crate::hierarchy::{HaloExchangeMap, Hierarchy};
use crate::mapper::IndexMapper;
use crate::particles::{DriftPredictor, ParticleStore, PositionPredictor};
use crate::scratch::{AttributeBuffers, CollectScratch};
use crate::tools::{argsort, exclusive_prefix_sums, match_sorted_keys, reorder};
use crate::verify;

/// Misuse of the collector interface.
///
/// These errors are reported before any exchange is posted, so rejecting a
/// request never leaves the collective in an inconsistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectError {
    /// Count-only collection cannot be combined with position prediction.
    CountOnlyWithPrediction,
    /// Count-only collection cannot be combined with halo collection.
    CountOnlyWithHalo,
    /// A previous round on the same level was not released.
    AlreadyCollected {
        /// The target level of the offending request.
        level: usize,
        /// The first patch still carrying scratch state.
        patch: usize,
        /// The count stored on that patch.
        count: i32,
    },
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::CountOnlyWithPrediction => {
                write!(f, "count-only collection cannot predict positions")
            }
            CollectError::CountOnlyWithHalo => {
                write!(f, "count-only collection cannot include buffer patches")
            }
            CollectError::AlreadyCollected {
                level,
                patch,
                count,
            } => write!(
                f,
                "scratch state already initialized (level {}, patch {}, count {})",
                level, patch, count
            ),
        }
    }
}

impl std::error::Error for CollectError {}

/// One collection request.
#[derive(Copy, Clone, Debug)]
pub struct CollectRequest {
    /// The target (father) level onto which descendants are collected.
    pub level: usize,
    /// Extrapolate positions to `target_time` before transmission.
    pub predict_position: bool,
    /// The synchronization time for position prediction.
    pub target_time: f64,
    /// Also populate sibling-buffer patches at the target level.
    pub sibling_halo: bool,
    /// Also populate father-sibling-buffer patches one level below.
    pub parent_halo: bool,
    /// Only compute counts, do not gather attributes.
    pub count_only: bool,
}

impl CollectRequest {
    /// A full collection of mass and position onto `level`.
    pub fn full(level: usize) -> Self {
        Self {
            level,
            predict_position: false,
            target_time: 0.0,
            sibling_halo: false,
            parent_halo: false,
            count_only: false,
        }
    }

    /// A request computing only the per-patch counts at `level`.
    pub fn count_only(level: usize) -> Self {
        Self {
            count_only: true,
            ..Self::full(level)
        }
    }

    /// Enable position prediction to `target_time`.
    pub fn with_prediction(mut self, target_time: f64) -> Self {
        self.predict_position = true;
        self.target_time = target_time;
        self
    }

    /// Also collect for sibling-buffer patches at the target level.
    pub fn with_sibling_halo(mut self) -> Self {
        self.sibling_halo = true;
        self
    }

    /// Also collect for father-sibling-buffer patches one level below.
    pub fn with_parent_halo(mut self) -> Self {
        self.parent_halo = true;
        self
    }
}

/// Gathers mass and position of all descendant particles onto father patches.
///
/// One collector instance serves many rounds. Every successful
/// [collect](Collector::collect) must be paired with a
/// [release](Collector::release) on the same scope before the next round on
/// an overlapping scope.
pub struct Collector<'a, E, P = DriftPredictor> {
    mapper: &'a IndexMapper,
    exchange: &'a E,
    predictor: P,
    verify: bool,
}

impl<'a, E: DataExchange> Collector<'a, E> {
    /// Create a collector with the default drift predictor.
    ///
    /// Verification defaults to on in debug builds and off otherwise.
    pub fn new(mapper: &'a IndexMapper, exchange: &'a E) -> Self {
        Self {
            mapper,
            exchange,
            predictor: DriftPredictor,
            verify: cfg!(debug_assertions),
        }
    }
}

impl<'a, E: DataExchange, P: PositionPredictor> Collector<'a, E, P> {
    /// Replace the position predictor.
    pub fn with_predictor<Q: PositionPredictor>(self, predictor: Q) -> Collector<'a, E, Q> {
        Collector {
            mapper: self.mapper,
            exchange: self.exchange,
            predictor,
            verify: self.verify,
        }
    }

    /// Enable or disable the consistency checks.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Collect particles from all descendants onto the patches at the target level.
    ///
    /// Populates the scratch count for every non-leaf real patch at the
    /// level and, unless the request is count-only, the scratch attribute
    /// buffers. Particles residing transitionally on non-leaf patches at the
    /// level itself are included once, without extrapolation. Leaf patches
    /// at the level are never touched.
    ///
    /// This is a collective call. All ranks must pass the same flags.
    pub fn collect(
        &self,
        hierarchy: &Hierarchy,
        store: &ParticleStore,
        scratch: &mut CollectScratch,
        request: &CollectRequest,
    ) -> Result<(), CollectError> {
        if request.count_only {
            if request.predict_position {
                return Err(CollectError::CountOnlyWithPrediction);
            }
            if request.sibling_halo || request.parent_halo {
                return Err(CollectError::CountOnlyWithHalo);
            }
        }

        // Nothing to do for levels above the maximum level.
        if request.level >= hierarchy.num_levels() {
            return Ok(());
        }

        let level = request.level;

        if let Some((patch, count)) = verify::find_initialized_patch(hierarchy, scratch, level) {
            return Err(CollectError::AlreadyCollected {
                level,
                patch,
                count,
            });
        }

        // The maximum level has no descendants. Only buffer patches need data.
        if level == hierarchy.max_level() {
            if request.sibling_halo {
                self.collect_from_real_patches(hierarchy, store, scratch, level, request);
            }
            if request.parent_halo && level > 0 {
                self.collect_from_real_patches(hierarchy, store, scratch, level - 1, request);
            }
            return Ok(());
        }

        if self.verify {
            verify::check_deep_patches(hierarchy, level);
        }

        let num_ranks = self.exchange.size();

        // 1. Walk all particle-bearing patches below the target level and
        // count, per destination rank, the contributing patches and particles.
        // The destination is the rank owning the ancestor key at the target level.

        let mut patches_for_rank = vec![0i32; num_ranks];
        let mut particles_for_rank = vec![0i32; num_ranks];

        for deep_level in level + 1..hierarchy.num_levels() {
            let gap = (deep_level - level) as u32;
            for (_, patch) in hierarchy.level(deep_level).real_patches() {
                let npar = patch.particle_count();
                if npar == 0 {
                    continue;
                }

                let father_key = self.mapper.coarsen(patch.key(), gap);
                let dest = self.mapper.owner_rank(level, father_key);

                patches_for_rank[dest] += 1;
                particles_for_rank[dest] += npar;
            }
        }

        // 2. Pack three streams grouped by destination rank and sharing one
        // per-patch ordering: the ancestor keys, the per-patch particle
        // counts and, unless count-only, the interleaved attribute records.

        let total_patches = patches_for_rank.iter().sum::<i32>() as usize;
        let total_particles = particles_for_rank.iter().sum::<i32>() as usize;

        let mut patch_cursor = exclusive_prefix_sums(&patches_for_rank);
        let mut particle_cursor = exclusive_prefix_sums(&particles_for_rank);

        let mut send_keys = vec![0_u64; total_patches];
        let mut send_counts = vec![0_i32; total_patches];
        let mut send_payload = if request.count_only {
            Vec::new()
        } else {
            vec![0.0_f64; total_particles * NUM_ATTRIBUTES]
        };

        for deep_level in level + 1..hierarchy.num_levels() {
            let gap = (deep_level - level) as u32;
            for (_, patch) in hierarchy.level(deep_level).real_patches() {
                let npar = patch.particle_count();
                if npar == 0 {
                    continue;
                }

                let father_key = self.mapper.coarsen(patch.key(), gap);
                let dest = self.mapper.owner_rank(level, father_key);

                let slot = patch_cursor[dest] as usize;
                send_keys[slot] = father_key;
                send_counts[slot] = npar;
                patch_cursor[dest] += 1;

                if !request.count_only {
                    let mut offset = particle_cursor[dest] as usize * NUM_ATTRIBUTES;
                    for &id in patch.particles() {
                        if self.verify && !store.is_active(id) {
                            panic!(
                                "inactive particle {} in the particle list of a patch (level {})",
                                id, deep_level
                            );
                        }

                        let pos = if request.predict_position {
                            if self.verify {
                                verify::check_predictable(store, id);
                            }
                            self.predictor.predict(store, id, request.target_time)
                        } else {
                            store.position(id)
                        };

                        send_payload[offset + ATTR_MASS] = store.mass(id);
                        send_payload[offset + ATTR_POS_X] = pos[0];
                        send_payload[offset + ATTR_POS_Y] = pos[1];
                        send_payload[offset + ATTR_POS_Z] = pos[2];
                        offset += NUM_ATTRIBUTES;
                    }
                    particle_cursor[dest] += npar;
                }
            }
        }

        // 3. The exchange. Count-only rounds never post the payload stream.

        let (recv_keys, _) = self.exchange.exchange(&send_keys, &patches_for_rank);
        let (recv_counts, _) = self.exchange.exchange(&send_counts, &patches_for_rank);

        let recv_payload = if request.count_only {
            Vec::new()
        } else {
            let payload_counts = particles_for_rank
                .iter()
                .map(|&n| n * NUM_ATTRIBUTES as i32)
                .collect::<Vec<_>>();
            self.exchange.exchange(&send_payload, &payload_counts).0
        };

        // 4. Merge. Counts are seeded with the transitional particles of
        // non-leaf real patches, so only leaf patches keep the sentinel.

        for (patch_id, patch) in hierarchy.level(level).real_patches() {
            if !patch.is_leaf() {
                scratch.set_count(level, patch_id, patch.particle_count());
            }
        }

        // Match the received keys against the sorted real keys at the level.
        // Several source patches may share one father, so duplicate keys are
        // expected and their counts accumulate.

        let order = argsort(&recv_keys);
        let sorted_keys = reorder(&recv_keys, &order);
        let matches = match_sorted_keys(hierarchy.level(level).sorted_real_keys(), &sorted_keys);

        let mut target_patch = vec![usize::MAX; recv_keys.len()];

        for (&recv_index, matched) in izip!(order.iter(), matches.iter()) {
            let sorted_position = matched.unwrap_or_else(|| {
                panic!(
                    "received key {} found no match at level {}",
                    recv_keys[recv_index], level
                )
            });
            let patch_id = hierarchy.level(level).real_id_at_sorted(sorted_position);

            if self.verify && hierarchy.level(level).patch(patch_id).is_leaf() {
                panic!(
                    "received particles for leaf patch (level {}, patch {})",
                    level, patch_id
                );
            }

            scratch.add_count(level, patch_id, recv_counts[recv_index]);
            target_patch[recv_index] = patch_id;
        }

        if !request.count_only {
            // Allocate the attribute buffers now that the final counts are known.
            for patch_id in 0..hierarchy.level(level).num_real() {
                let count = scratch.count(level, patch_id);
                if count > 0 {
                    scratch.insert_buffers(
                        level,
                        patch_id,
                        AttributeBuffers::with_capacity(count as usize),
                    );
                }
            }

            // Copy the received records in receive order.
            let records: &[[f64; NUM_ATTRIBUTES]] = bytemuck::cast_slice(&recv_payload);
            let mut cursor = 0_usize;

            for (&patch_id, &count) in izip!(target_patch.iter(), recv_counts.iter()) {
                for &record in &records[cursor..cursor + count as usize] {
                    if self.verify {
                        verify::check_received_record(
                            record,
                            hierarchy.level(level).patch(patch_id).extent(),
                            request.predict_position,
                            level,
                            patch_id,
                        );
                    }
                    scratch.buffers_mut(level, patch_id).push(record);
                }
                cursor += count as usize;
            }

            // Append the transitional particles of each non-leaf patch. They
            // are already synchronized to the target time, so their stored
            // positions are used as is.
            for patch_id in 0..hierarchy.level(level).num_real() {
                let patch = hierarchy.level(level).patch(patch_id);
                if patch.is_leaf() || patch.particle_count() == 0 {
                    continue;
                }

                for &id in patch.particles() {
                    if self.verify {
                        verify::check_transitional_time(store, id, level, patch_id);
                    }

                    let pos = store.position(id);
                    let mut record = [0.0; NUM_ATTRIBUTES];
                    record[ATTR_MASS] = store.mass(id);
                    record[ATTR_POS_X] = pos[0];
                    record[ATTR_POS_Y] = pos[1];
                    record[ATTR_POS_Z] = pos[2];
                    scratch.buffers_mut(level, patch_id).push(record);
                }
            }
        }

        // 5. Buffer patches receive their data from the owning real patches.

        if request.sibling_halo {
            self.collect_from_real_patches(hierarchy, store, scratch, level, request);
        }
        if request.parent_halo && level > 0 {
            self.collect_from_real_patches(hierarchy, store, scratch, level - 1, request);
        }

        // 6. Every particle at the target level and below must now be
        // accounted for on exactly one real patch.

        if self.verify {
            verify::check_conservation(hierarchy, store, scratch, self.exchange, level);
        }

        Ok(())
    }

    /// Release the scratch state of a collection round.
    ///
    /// Resets every real patch at `level` and, if requested, the
    /// sibling-buffer patches at `level` and the father-sibling-buffer
    /// patches at `level - 1`. Idempotent.
    pub fn release(
        &self,
        hierarchy: &Hierarchy,
        scratch: &mut CollectScratch,
        level: usize,
        sibling_halo: bool,
        parent_halo: bool,
    ) {
        scratch.release(hierarchy, level, sibling_halo, parent_halo);

        if self.verify {
            verify::check_released(hierarchy, scratch, level);
        }
    }

    /// Populate buffer patches at `target_level` from their owning real patches.
    ///
    /// The correspondence between buffer and real patches is taken from the
    /// precomputed halo tables. Real leaf patches contribute their owned
    /// particles, non-leaf real patches their freshly collected copy.
    fn collect_from_real_patches(
        &self,
        hierarchy: &Hierarchy,
        store: &ParticleStore,
        scratch: &mut CollectScratch,
        target_level: usize,
        request: &CollectRequest,
    ) {
        let map: &HaloExchangeMap = if target_level == request.level {
            &hierarchy.halo_maps(request.level).sibling
        } else {
            &hierarchy.halo_maps(request.level).father_sibling
        };

        let plevel = hierarchy.level(target_level);
        let num_ranks = self.exchange.size();

        let mut send_counts = Vec::<i32>::with_capacity(map.real_patches.len());
        let mut send_payload = Vec::<f64>::new();
        let mut particles_for_rank = vec![0_i32; num_ranks];

        let mut next_real = 0_usize;
        for (rank, &npatches) in map.real_counts_per_rank.iter().enumerate() {
            for _ in 0..npatches {
                let patch_id = map.real_patches[next_real];
                next_real += 1;

                let patch = plevel.patch(patch_id);
                if patch.is_leaf() {
                    send_counts.push(patch.particle_count());
                    particles_for_rank[rank] += patch.particle_count();

                    for &id in patch.particles() {
                        // Particles still waiting for their velocity
                        // correction are synchronized already and must not
                        // be drifted again.
                        let pos = if request.predict_position && store.time(id) >= 0.0 {
                            self.predictor.predict(store, id, request.target_time)
                        } else {
                            store.position(id)
                        };

                        send_payload.push(store.mass(id));
                        send_payload.push(pos[0]);
                        send_payload.push(pos[1]);
                        send_payload.push(pos[2]);
                    }
                } else {
                    let count = scratch.count(target_level, patch_id);
                    if count < 0 {
                        panic!(
                            "halo collection before main collection (level {}, patch {})",
                            target_level, patch_id
                        );
                    }

                    send_counts.push(count);
                    particles_for_rank[rank] += count;

                    if count > 0 {
                        let buffers = scratch.buffers(target_level, patch_id).unwrap_or_else(|| {
                            panic!(
                                "collected patch has no buffers (level {}, patch {})",
                                target_level, patch_id
                            )
                        });

                        for p in 0..count as usize {
                            let pos = buffers.position(p);
                            send_payload.push(buffers.mass()[p]);
                            send_payload.push(pos[0]);
                            send_payload.push(pos[1]);
                            send_payload.push(pos[2]);
                        }
                    }
                }
            }
        }

        let (recv_counts, patches_per_rank) = self
            .exchange
            .exchange(&send_counts, &map.real_counts_per_rank);

        // The receive loop below relies on the per-rank grouping of the halo
        // table agreeing with what the peers actually sent.
        if self.verify && patches_per_rank != map.buffer_counts_per_rank {
            panic!(
                "halo table disagrees with exchange on patches per source rank (level {}, table {:?}, received {:?})",
                target_level, map.buffer_counts_per_rank, patches_per_rank
            );
        }

        let payload_counts = particles_for_rank
            .iter()
            .map(|&n| n * NUM_ATTRIBUTES as i32)
            .collect::<Vec<_>>();
        let (recv_payload, _) = self.exchange.exchange(&send_payload, &payload_counts);

        assert_eq!(recv_counts.len(), map.buffer_patches.len());

        let records: &[[f64; NUM_ATTRIBUTES]] = bytemuck::cast_slice(&recv_payload);
        let mut cursor = 0_usize;

        for (&patch_id, &count) in izip!(map.buffer_patches.iter(), recv_counts.iter()) {
            if self.verify && !scratch.is_unset(target_level, patch_id) {
                panic!(
                    "buffer patch already populated (level {}, patch {}, count {})",
                    target_level,
                    patch_id,
                    scratch.count(target_level, patch_id)
                );
            }

            scratch.set_count(target_level, patch_id, count);

            if count > 0 {
                let mut buffers = AttributeBuffers::with_capacity(count as usize);
                for &record in &records[cursor..cursor + count as usize] {
                    if self.verify {
                        verify::check_received_record(
                            record,
                            plevel.patch(patch_id).extent(),
                            request.predict_position,
                            target_level,
                            patch_id,
                        );
                    }
                    buffers.push(record);
                }
                scratch.insert_buffers(target_level, patch_id, buffers);
                cursor += count as usize;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{CollectError, CollectRequest, Collector};
    use crate::exchange::LocalExchange;
    use crate::geometry::PatchExtent;
    use crate::hierarchy::{HaloExchangeMap, Hierarchy, LevelHaloMaps, Patch, PatchLevel};
    use crate::mapper::{CoarsenRule, IndexMapper};
    use crate::particles::ParticleStore;
    use crate::scratch::CollectScratch;

    fn unit_mapper(num_levels: usize) -> IndexMapper {
        IndexMapper::new(CoarsenRule::KeyDivision, vec![vec![0]; num_levels])
    }

    fn father_extent() -> PatchExtent {
        PatchExtent::new([0.0; 3], [1.0; 3])
    }

    /// One non-leaf father at level 0 with two leaf children at level 1,
    /// holding one particle each.
    fn two_leaf_scenario() -> (Hierarchy, ParticleStore) {
        let fathers = vec![Patch::new(0, father_extent()).with_child(0)];
        let leaves = vec![
            Patch::new(0, PatchExtent::new([0.0; 3], [0.5; 3])),
            Patch::new(1, PatchExtent::new([0.5, 0.0, 0.0], [1.0, 0.5, 0.5])),
        ];

        let mut hierarchy = Hierarchy::new(
            vec![
                PatchLevel::new(fathers, Vec::new()),
                PatchLevel::new(leaves, Vec::new()),
            ],
            1,
        );

        let mut store = ParticleStore::new(2);
        let a = store.add_particle(1.0, [0.1; 3], [0.0; 3], 0.0, 1);
        let b = store.add_particle(2.0, [0.2; 3], [0.0; 3], 0.0, 1);
        hierarchy.level_mut(1).patch_mut(0).assign_particles(vec![a]);
        hierarchy.level_mut(1).patch_mut(1).assign_particles(vec![b]);

        (hierarchy, store)
    }

    fn collected_mass_pos(
        scratch: &CollectScratch,
        level: usize,
        patch: usize,
    ) -> Vec<(f64, [f64; 3])> {
        let buffers = scratch.buffers(level, patch).unwrap();
        let mut result = (0..buffers.len())
            .map(|p| (buffers.mass()[p], buffers.position(p)))
            .collect::<Vec<_>>();
        result.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        result
    }

    #[test]
    fn test_round_trip_collects_descendants() {
        let (hierarchy, store) = two_leaf_scenario();
        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        collector
            .collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(0))
            .unwrap();

        assert_eq!(scratch.count(0, 0), 2);

        let collected = collected_mass_pos(&scratch, 0, 0);
        assert_eq!(collected[0], (1.0, [0.1, 0.1, 0.1]));
        assert_eq!(collected[1], (2.0, [0.2, 0.2, 0.2]));

        // Leaf patches are never targeted.
        assert!(scratch.is_unset(1, 0));
        assert!(scratch.is_unset(1, 1));
    }

    #[test]
    fn test_count_only_matches_full_collection() {
        let (hierarchy, store) = two_leaf_scenario();
        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        collector
            .collect(
                &hierarchy,
                &store,
                &mut scratch,
                &CollectRequest::count_only(0),
            )
            .unwrap();

        assert_eq!(scratch.count(0, 0), 2);
        assert!(scratch.buffers(0, 0).is_none());

        collector.release(&hierarchy, &mut scratch, 0, false, false);

        collector
            .collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(0))
            .unwrap();

        assert_eq!(scratch.count(0, 0), 2);
    }

    #[test]
    fn test_transitional_particles_merge_once() {
        let (mut hierarchy, mut store) = two_leaf_scenario();

        // Three particles wait on the father for their velocity correction.
        // Their stored positions are already synchronized, so prediction
        // must not touch them despite the large velocity.
        let transitional = (0..3)
            .map(|p| {
                store.add_particle(
                    3.0 + p as f64,
                    [0.3 + 0.1 * p as f64, 0.3, 0.3],
                    [9.0; 3],
                    -0.5,
                    0,
                )
            })
            .collect::<Vec<_>>();
        hierarchy
            .level_mut(0)
            .patch_mut(0)
            .assign_particles(transitional);

        // Three more descendants for a total of five.
        let extra = (0..3)
            .map(|p| store.add_particle(10.0 + p as f64, [0.4, 0.4, 0.4], [0.0; 3], 0.0, 1))
            .collect::<Vec<_>>();
        let mut leaf_particles = hierarchy.level(1).patch(0).particles().to_vec();
        leaf_particles.extend(extra);
        hierarchy
            .level_mut(1)
            .patch_mut(0)
            .assign_particles(leaf_particles);

        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        collector
            .collect(
                &hierarchy,
                &store,
                &mut scratch,
                &CollectRequest::full(0).with_prediction(1.0),
            )
            .unwrap();

        assert_eq!(scratch.count(0, 0), 8);

        let collected = collected_mass_pos(&scratch, 0, 0);
        // The transitional particles keep their stored positions.
        assert_eq!(collected[2], (3.0, [0.3, 0.3, 0.3]));
        assert_eq!(collected[3], (4.0, [0.4, 0.3, 0.3]));
        assert_eq!(collected[4], (5.0, [0.5, 0.3, 0.3]));
    }

    #[test]
    fn test_prediction_drifts_descendants() {
        let (mut hierarchy, mut store) = two_leaf_scenario();

        let moving = store.add_particle(5.0, [0.3, 0.3, 0.3], [1.0, 0.0, 0.0], 0.0, 1);
        let mut leaf_particles = hierarchy.level(1).patch(0).particles().to_vec();
        leaf_particles.push(moving);
        hierarchy
            .level_mut(1)
            .patch_mut(0)
            .assign_particles(leaf_particles);

        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        collector
            .collect(
                &hierarchy,
                &store,
                &mut scratch,
                &CollectRequest::full(0).with_prediction(0.25),
            )
            .unwrap();

        let collected = collected_mass_pos(&scratch, 0, 0);
        assert_eq!(collected[2], (5.0, [0.55, 0.3, 0.3]));
    }

    #[test]
    fn test_count_only_rejects_prediction_and_halo() {
        let (hierarchy, store) = two_leaf_scenario();
        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        let request = CollectRequest::count_only(0).with_prediction(1.0);
        assert_eq!(
            collector.collect(&hierarchy, &store, &mut scratch, &request),
            Err(CollectError::CountOnlyWithPrediction)
        );

        let request = CollectRequest::count_only(0).with_sibling_halo();
        assert_eq!(
            collector.collect(&hierarchy, &store, &mut scratch, &request),
            Err(CollectError::CountOnlyWithHalo)
        );

        // Rejection happens before any state is touched.
        assert!(scratch.is_unset(0, 0));
    }

    #[test]
    fn test_second_collect_without_release_is_rejected() {
        let (hierarchy, store) = two_leaf_scenario();
        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        collector
            .collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(0))
            .unwrap();

        assert_eq!(
            collector.collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(0)),
            Err(CollectError::AlreadyCollected {
                level: 0,
                patch: 0,
                count: 2
            })
        );

        // After a release the next round proceeds.
        collector.release(&hierarchy, &mut scratch, 0, false, false);
        collector
            .collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(0))
            .unwrap();
        assert_eq!(scratch.count(0, 0), 2);
    }

    #[test]
    fn test_release_resets_scratch_state() {
        let (hierarchy, store) = two_leaf_scenario();
        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        collector
            .collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(0))
            .unwrap();
        collector.release(&hierarchy, &mut scratch, 0, false, false);

        assert!(scratch.is_unset(0, 0));

        // Releasing twice is safe.
        collector.release(&hierarchy, &mut scratch, 0, false, false);
        assert!(scratch.is_unset(0, 0));
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_particle_outside_father_is_rejected() {
        let (mut hierarchy, mut store) = two_leaf_scenario();

        let stray = store.add_particle(7.0, [1.5, 0.1, 0.1], [0.0; 3], 0.0, 1);
        let mut leaf_particles = hierarchy.level(1).patch(1).particles().to_vec();
        leaf_particles.push(stray);
        hierarchy
            .level_mut(1)
            .patch_mut(1)
            .assign_particles(leaf_particles);

        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        let _ = collector.collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(0));
    }

    #[test]
    #[should_panic(expected = "expected")]
    fn test_conservation_mismatch_is_fatal() {
        let (hierarchy, mut store) = two_leaf_scenario();

        // An active particle tracked in the population but not owned by any
        // patch breaks conservation.
        store.add_particle(9.0, [0.9; 3], [0.0; 3], 0.0, 1);

        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        let _ = collector.collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(0));
    }

    #[test]
    #[should_panic(expected = "no match")]
    fn test_unmatched_key_is_fatal() {
        let (mut hierarchy, mut store) = two_leaf_scenario();

        // A leaf whose father key does not exist at the target level.
        let orphan = store.add_particle(1.0, [0.9; 3], [0.0; 3], 0.0, 1);
        let leaves = vec![Patch::new(9, PatchExtent::new([0.0; 3], [0.5; 3]))];
        let mut level = PatchLevel::new(leaves, Vec::new());
        level.patch_mut(0).assign_particles(vec![orphan]);
        *hierarchy.level_mut(1) = level;

        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        let _ = collector.collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(0));
    }

    #[test]
    fn test_above_max_level_is_a_noop() {
        let (hierarchy, store) = two_leaf_scenario();
        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        collector
            .collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(5))
            .unwrap();

        assert!(scratch.is_unset(0, 0));
    }

    #[test]
    fn test_max_level_without_halo_is_a_noop() {
        let (hierarchy, store) = two_leaf_scenario();
        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        collector
            .collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(1))
            .unwrap();

        assert!(scratch.is_unset(1, 0));
        assert!(scratch.is_unset(1, 1));
    }

    #[test]
    fn test_sibling_halo_mirrors_collected_data() {
        let (mut hierarchy, store) = two_leaf_scenario();

        // A buffer patch shadowing the father, wired to it through the halo
        // table. On a single rank the exchange sends the data to itself.
        let fathers = vec![Patch::new(0, father_extent()).with_child(0)];
        let buffer = vec![Patch::new(0, father_extent())];
        *hierarchy.level_mut(0) = PatchLevel::new(fathers, buffer);

        hierarchy.set_halo_maps(
            0,
            LevelHaloMaps {
                sibling: HaloExchangeMap {
                    buffer_patches: vec![1],
                    buffer_counts_per_rank: vec![1],
                    real_patches: vec![0],
                    real_counts_per_rank: vec![1],
                },
                father_sibling: HaloExchangeMap::empty(1),
            },
        );

        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        collector
            .collect(
                &hierarchy,
                &store,
                &mut scratch,
                &CollectRequest::full(0).with_sibling_halo(),
            )
            .unwrap();

        assert_eq!(scratch.count(0, 1), 2);
        assert_eq!(collected_mass_pos(&scratch, 0, 1), collected_mass_pos(&scratch, 0, 0));

        collector.release(&hierarchy, &mut scratch, 0, true, false);
        assert!(scratch.is_unset(0, 0));
        assert!(scratch.is_unset(0, 1));
    }

    #[test]
    fn test_parent_halo_sends_leaf_particles() {
        let (mut hierarchy, mut store) = two_leaf_scenario();

        // Level 0 gains a leaf real patch with two particles of its own and
        // a buffer patch shadowing it. Collecting at the maximum level with
        // the parent halo enabled populates the buffer patch.
        let c = store.add_particle(4.0, [0.6; 3], [0.0; 3], 0.0, 0);
        let d = store.add_particle(5.0, [0.7; 3], [0.0; 3], 0.0, 0);
        let fathers = vec![
            Patch::new(0, father_extent()).with_child(0),
            Patch::new(1, PatchExtent::new([0.5; 3], [1.0; 3])),
        ];
        let buffer = vec![Patch::new(1, PatchExtent::new([0.5; 3], [1.0; 3]))];
        let mut level = PatchLevel::new(fathers, buffer);
        level.patch_mut(1).assign_particles(vec![c, d]);
        *hierarchy.level_mut(0) = level;

        hierarchy.set_halo_maps(
            1,
            LevelHaloMaps {
                sibling: HaloExchangeMap::empty(1),
                father_sibling: HaloExchangeMap {
                    buffer_patches: vec![2],
                    buffer_counts_per_rank: vec![1],
                    real_patches: vec![1],
                    real_counts_per_rank: vec![1],
                },
            },
        );

        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        collector
            .collect(
                &hierarchy,
                &store,
                &mut scratch,
                &CollectRequest::full(1).with_parent_halo(),
            )
            .unwrap();

        assert_eq!(scratch.count(0, 2), 2);
        let collected = collected_mass_pos(&scratch, 0, 2);
        assert_eq!(collected[0], (4.0, [0.6, 0.6, 0.6]));
        assert_eq!(collected[1], (5.0, [0.7, 0.7, 0.7]));

        collector.release(&hierarchy, &mut scratch, 1, false, true);
        assert!(scratch.is_unset(0, 2));
    }

    #[test]
    #[should_panic(expected = "patches per source rank")]
    fn test_halo_table_rank_mismatch_is_fatal() {
        let (mut hierarchy, store) = two_leaf_scenario();

        let fathers = vec![Patch::new(0, father_extent()).with_child(0)];
        let buffer = vec![Patch::new(0, father_extent())];
        *hierarchy.level_mut(0) = PatchLevel::new(fathers, buffer);

        // The table promises 99 patches from rank 0, the sender delivers 1.
        hierarchy.set_halo_maps(
            0,
            LevelHaloMaps {
                sibling: HaloExchangeMap {
                    buffer_patches: vec![1],
                    buffer_counts_per_rank: vec![99],
                    real_patches: vec![0],
                    real_counts_per_rank: vec![1],
                },
                father_sibling: HaloExchangeMap::empty(1),
            },
        );

        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        let _ = collector.collect(
            &hierarchy,
            &store,
            &mut scratch,
            &CollectRequest::full(0).with_sibling_halo(),
        );
    }

    #[test]
    #[should_panic(expected = "in the particle list")]
    fn test_inactive_particle_in_patch_list_is_fatal() {
        let (mut hierarchy, mut store) = two_leaf_scenario();

        let removed = store.add_particle(-1.0, [0.3; 3], [0.0; 3], 0.0, 1);
        let mut leaf_particles = hierarchy.level(1).patch(0).particles().to_vec();
        leaf_particles.push(removed);
        hierarchy
            .level_mut(1)
            .patch_mut(0)
            .assign_particles(leaf_particles);

        let mapper = unit_mapper(2);
        let exchange = LocalExchange;
        let mut scratch = CollectScratch::new(&hierarchy);
        let collector = Collector::new(&mapper, &exchange).with_verification(true);

        let _ = collector.collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(0));
    }
}
