//! Cell coordinates and positions.
//!
//! A cell is a fixed 16×16 horizontal column of the world. Cells are the unit
//! of loading, unloading and activity tracking.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Width of a cell in blocks along X and Z.
pub const CELL_SIZE: i32 = 16;

/// Name of a world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldId(String);

impl WorldId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorldId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Identifies an observer (a connected player).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(pub Uuid);

impl ObserverId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Grid coordinate of a cell within a world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellCoord {
    pub world: WorldId,
    pub x: i32,
    pub z: i32,
}

impl CellCoord {
    pub fn new(world: WorldId, x: i32, z: i32) -> Self {
        Self { world, x, z }
    }

    /// The cell containing the given block column.
    pub fn containing_block(world: WorldId, block_x: i32, block_z: i32) -> Self {
        Self {
            world,
            x: block_x.div_euclid(CELL_SIZE),
            z: block_z.div_euclid(CELL_SIZE),
        }
    }

    /// Neighbouring cell at the given grid offset, same world.
    pub fn offset(&self, dx: i32, dz: i32) -> Self {
        Self {
            world: self.world.clone(),
            x: self.x + dx,
            z: self.z + dz,
        }
    }

    /// Chebyshev distance in cell units. `None` across worlds.
    pub fn chebyshev_distance(&self, other: &CellCoord) -> Option<i32> {
        if self.world != other.world {
            return None;
        }
        Some((self.x - other.x).abs().max((self.z - other.z).abs()))
    }

    /// Whether `other` lies within `radius` cells (inclusive) of this cell.
    pub fn within(&self, other: &CellCoord, radius: i32) -> bool {
        self.chebyshev_distance(other)
            .is_some_and(|distance| distance <= radius)
    }

    /// Block X of the cell's western edge.
    pub fn min_block_x(&self) -> i32 {
        self.x * CELL_SIZE
    }

    /// Block Z of the cell's northern edge.
    pub fn min_block_z(&self) -> i32 {
        self.z * CELL_SIZE
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, {}]", self.world, self.x, self.z)
    }
}

/// Position of an observer in block space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The cell this position falls into.
    pub fn cell(&self, world: WorldId) -> CellCoord {
        CellCoord::containing_block(world, self.x.floor() as i32, self.z.floor() as i32)
    }

    /// Horizontal displacement from `earlier` to `self`.
    pub fn horizontal_delta(&self, earlier: &Position) -> (f64, f64) {
        (self.x - earlier.x, self.z - earlier.z)
    }
}
