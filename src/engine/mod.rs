//! The seam between this crate and the simulation engine.
//!
//! The engine owns the world: which cells are loaded, what they contain, and
//! where observers stand. This crate only reads through [`WorldEngine`] and
//! asks it to load or unload cells.
//!
//! - [`clock`]: millisecond clock used for activity timestamps
//! - [`sim`]: deterministic in-memory engine

pub mod clock;
pub mod sim;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cell::coord::{CellCoord, ObserverId, Position, WorldId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Unknown world {0}")]
    UnknownWorld(WorldId),

    #[error("Cell {0} is not loaded")]
    NotLoaded(CellCoord),

    #[error("Engine refused to {action} cell {cell}: {reason}")]
    Refused {
        action: &'static str,
        cell: CellCoord,
        reason: String,
    },

    #[error("Scan of cell {cell} failed: {reason}")]
    ScanFailed { cell: CellCoord, reason: String },
}

/// Block material, as far as this crate cares.
///
/// Trivial materials are natural terrain filler and never count towards a
/// cell's diversity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Material {
    Air,
    Stone,
    Deepslate,
    Dirt,
    Grass,
    Sand,
    Gravel,
    Water,
    Lava,
    Bedrock,
    Netherrack,
    /// Any other material, identified by the engine's numeric id.
    Other(u16),
}

impl Material {
    pub fn is_trivial(&self) -> bool {
        !matches!(self, Material::Other(_))
    }
}

/// Kinds of block entity found in a cell's compact content list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Chest,
    Barrel,
    ShulkerBox,
    EnderChest,
    Beacon,
    Spawner,
    Lectern,
    EnchantingTable,
    BrewingStand,
    Furnace,
    Hopper,
    Sign,
    Banner,
    /// A power-carrying circuit component.
    Circuit { powered: bool },
}

impl ResourceKind {
    /// High-value blocks whose presence must keep a cell loaded.
    pub fn is_protected(&self) -> bool {
        matches!(
            self,
            ResourceKind::Chest
                | ResourceKind::Barrel
                | ResourceKind::ShulkerBox
                | ResourceKind::EnderChest
                | ResourceKind::Beacon
                | ResourceKind::Spawner
                | ResourceKind::Lectern
                | ResourceKind::EnchantingTable
                | ResourceKind::BrewingStand
        )
    }

    pub fn is_active_circuit(&self) -> bool {
        matches!(self, ResourceKind::Circuit { powered: true })
    }
}

/// A block entity at a cell-local position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub local_x: u8,
    pub y: i32,
    pub local_z: u8,
}

/// An entity inside a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub kind: String,
    pub custom_name: Option<String>,
    pub persistent: bool,
}

impl EntityInfo {
    pub fn is_named(&self) -> bool {
        self.custom_name.as_deref().is_some_and(|n| !n.is_empty())
    }
}

/// Square world border, in block coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldBorder {
    pub center_x: f64,
    pub center_z: f64,
    /// Half the side length.
    pub radius: f64,
}

impl WorldBorder {
    /// Whether any edge of `cell` is within `margin_cells` cells of the border edge.
    pub fn is_near_edge(&self, cell: &CellCoord, margin_cells: i32) -> bool {
        let margin = f64::from(margin_cells * crate::cell::coord::CELL_SIZE);
        let size = f64::from(crate::cell::coord::CELL_SIZE);
        let min_x = f64::from(cell.min_block_x());
        let min_z = f64::from(cell.min_block_z());

        let west = self.center_x - self.radius;
        let east = self.center_x + self.radius;
        let north = self.center_z - self.radius;
        let south = self.center_z + self.radius;

        min_x - west <= margin
            || east - (min_x + size) <= margin
            || min_z - north <= margin
            || south - (min_z + size) <= margin
    }
}

/// An observer as currently seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverSnapshot {
    pub id: ObserverId,
    pub world: WorldId,
    pub position: Position,
}

impl ObserverSnapshot {
    pub fn cell(&self) -> CellCoord {
        self.position.cell(self.world.clone())
    }
}

/// Primitives the simulation engine provides.
///
/// All calls are synchronous. Implementations must be safe to call from any
/// thread; mutation ordering is the engine's business.
pub trait WorldEngine: Send + Sync {
    /// Every world currently present, in a stable order.
    fn worlds(&self) -> Vec<WorldId>;

    /// Observers currently in `world`, in a stable order.
    fn observers(&self, world: &WorldId) -> Vec<ObserverSnapshot>;

    /// Loaded cells of `world`, in a stable enumeration order.
    fn loaded_cells(&self, world: &WorldId) -> Vec<CellCoord>;

    fn loaded_cell_count(&self, world: &WorldId) -> usize {
        self.loaded_cells(world).len()
    }

    fn is_loaded(&self, cell: &CellCoord) -> bool;

    /// Unload a cell. An error means the engine declined.
    fn unload_cell(&self, cell: &CellCoord) -> Result<(), EngineError>;

    /// Load a cell, generating it when `generate` is set and it does not exist yet.
    fn load_cell(&self, cell: &CellCoord, generate: bool) -> Result<(), EngineError>;

    /// Inclusive minimum and exclusive maximum build height.
    fn height_range(&self, world: &WorldId) -> (i32, i32);

    /// Material at a cell-local position.
    fn block_at(&self, cell: &CellCoord, local_x: u8, y: i32, local_z: u8) -> Result<Material, EngineError>;

    /// Block entities of a loaded cell.
    fn resources(&self, cell: &CellCoord) -> Result<Vec<Resource>, EngineError>;

    /// Entities of a loaded cell.
    fn entities(&self, cell: &CellCoord) -> Result<Vec<EntityInfo>, EngineError>;

    fn world_border(&self, _world: &WorldId) -> Option<WorldBorder> {
        None
    }

    /// Whether the engine runs independent regions on separate threads.
    fn supports_region_threading(&self) -> bool {
        false
    }

    /// Send a one-line notice to administrators.
    fn broadcast(&self, _message: &str) {}
}
