//! Geometry information for patches.

use bytemuck;

/// The axis aligned spatial extent of a patch.
///
/// The extent is the half-open box `[lower, upper)` along each axis.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PatchExtent {
    lower: [f64; 3],
    upper: [f64; 3],
}

impl PatchExtent {
    /// Create a new extent from lower and upper corners.
    pub fn new(lower: [f64; 3], upper: [f64; 3]) -> Self {
        Self { lower, upper }
    }

    /// Create an extent from a flat array `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    pub fn from_coords(coords: [f64; 6]) -> Self {
        let halves: &[[f64; 3]] = bytemuck::cast_slice(&coords);
        Self {
            lower: halves[0],
            upper: halves[1],
        }
    }

    /// Return the lower corner.
    pub fn lower(&self) -> [f64; 3] {
        self.lower
    }

    /// Return the upper corner.
    pub fn upper(&self) -> [f64; 3] {
        self.upper
    }

    /// Return true if the position lies within the half-open extent.
    pub fn contains(&self, pos: [f64; 3]) -> bool {
        (0..3).all(|d| pos[d] >= self.lower[d] && pos[d] < self.upper[d])
    }
}

impl std::fmt::Display for PatchExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(lower: {:?}, upper: {:?})",
            self.lower, self.upper
        )
    }
}
