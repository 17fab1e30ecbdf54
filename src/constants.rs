//! Crate wide constants.

/// Number of attributes carried per collected particle (mass and three position components).
pub const NUM_ATTRIBUTES: usize = 4;

/// Index of the mass component within an attribute record.
pub const ATTR_MASS: usize = 0;

/// Index of the x position component within an attribute record.
pub const ATTR_POS_X: usize = 1;

/// Index of the y position component within an attribute record.
pub const ATTR_POS_Y: usize = 2;

/// Index of the z position component within an attribute record.
pub const ATTR_POS_Z: usize = 3;

/// Sentinel marking a per-patch collected count as not computed in the current round.
pub const UNSET_COUNT: i32 = -1;

/// Number of children of a patch.
pub const NUM_CHILDREN: usize = 8;

/// Number of key bits consumed per refinement level.
pub const BITS_PER_LEVEL: u32 = 3;

/// Maximum refinement level representable by a 64 bit spatial key.
pub const DEEPEST_LEVEL: u32 = 21;
