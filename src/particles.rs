//! The global particle attribute store and position prediction.

/// Identifier of a particle within the global attribute arrays.
pub type ParticleId = u64;

/// The authoritative particle attribute arrays.
///
/// Attributes are stored in structure-of-arrays layout and indexed by
/// [ParticleId]. A negative mass marks a particle as inactive; inactive
/// particles are never transmitted. A negative stored time marks a particle
/// as waiting for its velocity correction while residing on a coarse patch.
///
/// The store also tracks the active particle population per refinement
/// level, summed over the local rank. The collector uses this population for
/// its conservation check and never modifies it.
pub struct ParticleStore {
    mass: Vec<f64>,
    pos: [Vec<f64>; 3],
    vel: [Vec<f64>; 3],
    time: Vec<f64>,
    level_populations: Vec<i64>,
}

impl ParticleStore {
    /// Create an empty store tracking populations for `num_levels` levels.
    pub fn new(num_levels: usize) -> Self {
        Self {
            mass: Vec::new(),
            pos: [Vec::new(), Vec::new(), Vec::new()],
            vel: [Vec::new(), Vec::new(), Vec::new()],
            time: Vec::new(),
            level_populations: vec![0; num_levels],
        }
    }

    /// Add a particle and return its identifier.
    ///
    /// `level` is the refinement level of the patch owning the particle and
    /// updates the tracked per-level population.
    pub fn add_particle(
        &mut self,
        mass: f64,
        pos: [f64; 3],
        vel: [f64; 3],
        time: f64,
        level: usize,
    ) -> ParticleId {
        let id = self.mass.len() as ParticleId;

        self.mass.push(mass);
        for d in 0..3 {
            self.pos[d].push(pos[d]);
            self.vel[d].push(vel[d]);
        }
        self.time.push(time);

        if mass >= 0.0 {
            self.level_populations[level] += 1;
        }

        id
    }

    /// Return the number of particles in the store.
    pub fn len(&self) -> usize {
        self.mass.len()
    }

    /// Return true if the store holds no particles.
    pub fn is_empty(&self) -> bool {
        self.mass.is_empty()
    }

    /// Return the mass of a particle.
    pub fn mass(&self, id: ParticleId) -> f64 {
        self.mass[id as usize]
    }

    /// Return the position of a particle.
    pub fn position(&self, id: ParticleId) -> [f64; 3] {
        [
            self.pos[0][id as usize],
            self.pos[1][id as usize],
            self.pos[2][id as usize],
        ]
    }

    /// Return the velocity of a particle.
    pub fn velocity(&self, id: ParticleId) -> [f64; 3] {
        [
            self.vel[0][id as usize],
            self.vel[1][id as usize],
            self.vel[2][id as usize],
        ]
    }

    /// Return the stored time of a particle.
    pub fn time(&self, id: ParticleId) -> f64 {
        self.time[id as usize]
    }

    /// Return true if the particle is active.
    pub fn is_active(&self, id: ParticleId) -> bool {
        self.mass[id as usize] >= 0.0
    }

    /// Return the tracked active particle population at a level.
    pub fn level_population(&self, level: usize) -> i64 {
        self.level_populations[level]
    }

    /// Return the tracked active particle population summed over `level..`.
    pub fn population_from_level(&self, level: usize) -> i64 {
        self.level_populations[level..].iter().sum()
    }
}

/// Projects particle positions forward to a synchronization time.
///
/// Predictors read the authoritative store and write into caller supplied
/// buffers. They must not mutate the store.
pub trait PositionPredictor {
    /// Predict the position of `id` at `target_time`.
    fn predict(&self, store: &ParticleStore, id: ParticleId, target_time: f64) -> [f64; 3];
}

/// Constant velocity drift to the target time.
#[derive(Copy, Clone, Debug, Default)]
pub struct DriftPredictor;

impl PositionPredictor for DriftPredictor {
    fn predict(&self, store: &ParticleStore, id: ParticleId, target_time: f64) -> [f64; 3] {
        let pos = store.position(id);
        let vel = store.velocity(id);
        let dt = target_time - store.time(id);

        [pos[0] + vel[0] * dt, pos[1] + vel[1] * dt, pos[2] + vel[2] * dt]
    }
}
