//! Test distributed particle collection across MPI ranks.
//!
//! Each rank owns one father patch and the leaf children of the *next*
//! rank's father, so every collection crosses a rank boundary.

use amr_parcollect::{
    collect::{CollectRequest, Collector},
    constants::NUM_CHILDREN,
    exchange::MpiExchange,
    geometry::PatchExtent,
    hierarchy::{Hierarchy, Patch, PatchLevel},
    mapper::{CoarsenRule, IndexMapper},
    particles::ParticleStore,
    scratch::CollectScratch,
    tools::generate_random_positions,
};
use mpi::traits::*;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::Uniform;

/// Extent of the father patch owned by the given rank.
fn father_extent(rank: u64) -> PatchExtent {
    PatchExtent::from_coords([rank as f64, 0.0, 0.0, rank as f64 + 1.0, 1.0, 1.0])
}

/// Extent of the `child`-th leaf inside a father extent.
fn leaf_extent(rank: u64, child: u64) -> PatchExtent {
    let lower = [
        rank as f64 + 0.5 * (child & 1) as f64,
        0.5 * ((child >> 1) & 1) as f64,
        0.5 * ((child >> 2) & 1) as f64,
    ];
    PatchExtent::new(lower, [lower[0] + 0.5, lower[1] + 0.5, lower[2] + 0.5])
}

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let comm = universe.world();

    let rank = comm.rank() as u64;
    let size = comm.size() as u64;

    // Initialise a seeded Rng.
    let mut rng = ChaCha8Rng::seed_from_u64(rank);

    // Create `npar` particles per leaf patch.
    let npar = 10;

    // The leaves held locally descend from the next rank's father.
    let target = (rank + 1) % size;

    let fathers = vec![Patch::new(rank, father_extent(rank)).with_child(0)];
    let leaves = (0..NUM_CHILDREN as u64)
        .map(|child| Patch::new(target * NUM_CHILDREN as u64 + child, leaf_extent(target, child)))
        .collect::<Vec<_>>();

    let mut hierarchy = Hierarchy::new(
        vec![
            PatchLevel::new(fathers, Vec::new()),
            PatchLevel::new(leaves, Vec::new()),
        ],
        size as usize,
    );

    // Populate every leaf with random particles inside its extent.
    let mut store = ParticleStore::new(2);
    let mass_distr = Uniform::new(0.5, 1.5);

    for child in 0..NUM_CHILDREN {
        let extent = leaf_extent(target, child as u64);
        let particles = generate_random_positions(npar, &mut rng)
            .iter()
            .map(|unit| {
                let pos = [
                    extent.lower()[0] + 0.5 * unit[0],
                    extent.lower()[1] + 0.5 * unit[1],
                    extent.lower()[2] + 0.5 * unit[2],
                ];
                store.add_particle(mass_distr.sample(&mut rng), pos, [0.0; 3], 0.0, 1)
            })
            .collect::<Vec<_>>();
        hierarchy.level_mut(1).patch_mut(child).assign_particles(particles);
    }

    // Every rank owns one key per level.
    let rank_bins = vec![
        (0..size).collect::<Vec<_>>(),
        (0..size).map(|r| r * NUM_CHILDREN as u64).collect::<Vec<_>>(),
    ];
    let mapper = IndexMapper::new(CoarsenRule::KeyDivision, rank_bins);

    let exchange = MpiExchange::new(&comm);
    let collector = Collector::new(&mapper, &exchange).with_verification(true);
    let mut scratch = CollectScratch::new(&hierarchy);

    collector
        .collect(&hierarchy, &store, &mut scratch, &CollectRequest::full(0))
        .unwrap();

    // The father receives every particle of its remote leaves.
    assert_eq!(scratch.count(0, 0), (NUM_CHILDREN * npar) as i32);

    let buffers = scratch.buffers(0, 0).unwrap();
    let extent = father_extent(rank);
    for p in 0..buffers.len() {
        assert!(extent.contains(buffers.position(p)));
    }

    collector.release(&hierarchy, &mut scratch, 0, false, false);

    if comm.rank() == 0 {
        println!(
            "Collected {} particles onto each father patch across {} ranks.",
            NUM_CHILDREN * npar,
            size
        );
    }
}
