//! In-memory [`WorldEngine`] with deterministic ordering.
//!
//! Backs the demo binary and the test suite. Worlds hold a set of loaded
//! cells, sparse block overrides on top of flat terrain, block entities,
//! entities, and observers. Individual cells can be told to refuse unloads,
//! refuse loads, or fail scans to exercise the failure paths.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

use crate::cell::coord::{CellCoord, ObserverId, Position, WorldId};
use crate::engine::{
    EngineError, EntityInfo, Material, ObserverSnapshot, Resource, ResourceKind, WorldBorder,
    WorldEngine,
};

/// Lowest build height of simulated worlds.
pub const SIM_MIN_Y: i32 = -64;
/// Exclusive top of simulated worlds.
pub const SIM_MAX_Y: i32 = 320;

#[derive(Debug, Default)]
struct SimCell {
    blocks: HashMap<(u8, i32, u8), Material>,
    resources: Vec<Resource>,
    entities: Vec<EntityInfo>,
}

#[derive(Debug, Default)]
struct SimWorld {
    loaded: BTreeSet<(i32, i32)>,
    /// Cells that exist on "disk" (were ever generated).
    generated: BTreeSet<(i32, i32)>,
    cells: HashMap<(i32, i32), SimCell>,
    observers: BTreeMap<u64, ObserverSnapshot>,
    next_observer_slot: u64,
    border: Option<WorldBorder>,
    unload_vetoes: HashSet<(i32, i32)>,
    load_refusals: HashSet<(i32, i32)>,
    scan_failures: HashSet<(i32, i32)>,
}

impl SimWorld {
    fn observer_slot(&self, id: ObserverId) -> Option<u64> {
        self.observers
            .iter()
            .find(|(_, o)| o.id == id)
            .map(|(slot, _)| *slot)
    }
}

/// Flat terrain: bedrock floor, stone, dirt, grass at y = 63, air above.
fn terrain_at(y: i32) -> Material {
    match y {
        y if y <= SIM_MIN_Y => Material::Bedrock,
        y if y < 0 => Material::Deepslate,
        y if y < 60 => Material::Stone,
        y if y < 63 => Material::Dirt,
        63 => Material::Grass,
        _ => Material::Air,
    }
}

/// Deterministic in-memory world engine.
#[derive(Debug, Default)]
pub struct SimulatedEngine {
    worlds: RwLock<BTreeMap<WorldId, SimWorld>>,
    region_threading: bool,
    broadcasts: Mutex<Vec<String>>,
    unload_calls: Mutex<Vec<CellCoord>>,
    load_calls: Mutex<Vec<CellCoord>>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that reports region-threading support.
    pub fn with_region_threading() -> Self {
        Self {
            region_threading: true,
            ..Self::default()
        }
    }

    pub fn add_world(&self, world: &WorldId) {
        self.worlds.write().entry(world.clone()).or_default();
    }

    pub fn set_border(&self, world: &WorldId, border: WorldBorder) {
        self.worlds.write().entry(world.clone()).or_default().border = Some(border);
    }

    /// Mark a cell as loaded (and generated) without going through `load_cell`.
    pub fn preload(&self, cell: &CellCoord) {
        let mut worlds = self.worlds.write();
        let world = worlds.entry(cell.world.clone()).or_default();
        world.loaded.insert((cell.x, cell.z));
        world.generated.insert((cell.x, cell.z));
    }

    /// Load every cell in the square of `radius` around (`center_x`, `center_z`).
    pub fn preload_square(&self, world: &WorldId, center_x: i32, center_z: i32, radius: i32) {
        for x in center_x - radius..=center_x + radius {
            for z in center_z - radius..=center_z + radius {
                self.preload(&CellCoord::new(world.clone(), x, z));
            }
        }
    }

    pub fn set_block(&self, cell: &CellCoord, local_x: u8, y: i32, local_z: u8, material: Material) {
        let mut worlds = self.worlds.write();
        let world = worlds.entry(cell.world.clone()).or_default();
        world
            .cells
            .entry((cell.x, cell.z))
            .or_default()
            .blocks
            .insert((local_x, y, local_z), material);
    }

    pub fn add_resource(&self, cell: &CellCoord, kind: ResourceKind) {
        let mut worlds = self.worlds.write();
        let world = worlds.entry(cell.world.clone()).or_default();
        world
            .cells
            .entry((cell.x, cell.z))
            .or_default()
            .resources
            .push(Resource {
                kind,
                local_x: 0,
                y: 64,
                local_z: 0,
            });
    }

    pub fn add_entity(&self, cell: &CellCoord, entity: EntityInfo) {
        let mut worlds = self.worlds.write();
        let world = worlds.entry(cell.world.clone()).or_default();
        world
            .cells
            .entry((cell.x, cell.z))
            .or_default()
            .entities
            .push(entity);
    }

    /// Place or move an observer. New observers keep insertion order.
    pub fn set_observer(&self, id: ObserverId, world: &WorldId, position: Position) {
        let mut worlds = self.worlds.write();
        for (name, w) in worlds.iter_mut() {
            if name != world {
                if let Some(slot) = w.observer_slot(id) {
                    w.observers.remove(&slot);
                }
            }
        }
        let target = worlds.entry(world.clone()).or_default();
        let snapshot = ObserverSnapshot {
            id,
            world: world.clone(),
            position,
        };
        match target.observer_slot(id) {
            Some(slot) => {
                target.observers.insert(slot, snapshot);
            }
            None => {
                let slot = target.next_observer_slot;
                target.next_observer_slot += 1;
                target.observers.insert(slot, snapshot);
            }
        }
    }

    pub fn remove_observer(&self, id: ObserverId) {
        let mut worlds = self.worlds.write();
        for w in worlds.values_mut() {
            if let Some(slot) = w.observer_slot(id) {
                w.observers.remove(&slot);
            }
        }
    }

    pub fn veto_unload(&self, cell: &CellCoord) {
        let mut worlds = self.worlds.write();
        worlds
            .entry(cell.world.clone())
            .or_default()
            .unload_vetoes
            .insert((cell.x, cell.z));
    }

    pub fn refuse_load(&self, cell: &CellCoord) {
        let mut worlds = self.worlds.write();
        worlds
            .entry(cell.world.clone())
            .or_default()
            .load_refusals
            .insert((cell.x, cell.z));
    }

    pub fn fail_scans(&self, cell: &CellCoord) {
        let mut worlds = self.worlds.write();
        worlds
            .entry(cell.world.clone())
            .or_default()
            .scan_failures
            .insert((cell.x, cell.z));
    }

    /// Messages passed to `broadcast`, oldest first.
    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().clone()
    }

    /// Every cell `unload_cell` was called with, including refused ones.
    pub fn unload_calls(&self) -> Vec<CellCoord> {
        self.unload_calls.lock().clone()
    }

    /// Every cell `load_cell` was called with, including refused ones.
    pub fn load_calls(&self) -> Vec<CellCoord> {
        self.load_calls.lock().clone()
    }

    fn with_loaded_cell<T>(
        &self,
        cell: &CellCoord,
        read: impl FnOnce(Option<&SimCell>) -> T,
    ) -> Result<T, EngineError> {
        let worlds = self.worlds.read();
        let world = worlds
            .get(&cell.world)
            .ok_or_else(|| EngineError::UnknownWorld(cell.world.clone()))?;
        let key = (cell.x, cell.z);
        if !world.loaded.contains(&key) {
            return Err(EngineError::NotLoaded(cell.clone()));
        }
        if world.scan_failures.contains(&key) {
            return Err(EngineError::ScanFailed {
                cell: cell.clone(),
                reason: "simulated read failure".to_string(),
            });
        }
        Ok(read(world.cells.get(&key)))
    }
}

impl WorldEngine for SimulatedEngine {
    fn worlds(&self) -> Vec<WorldId> {
        self.worlds.read().keys().cloned().collect()
    }

    fn observers(&self, world: &WorldId) -> Vec<ObserverSnapshot> {
        self.worlds
            .read()
            .get(world)
            .map(|w| w.observers.values().cloned().collect())
            .unwrap_or_default()
    }

    fn loaded_cells(&self, world: &WorldId) -> Vec<CellCoord> {
        self.worlds
            .read()
            .get(world)
            .map(|w| {
                w.loaded
                    .iter()
                    .map(|&(x, z)| CellCoord::new(world.clone(), x, z))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn loaded_cell_count(&self, world: &WorldId) -> usize {
        self.worlds
            .read()
            .get(world)
            .map(|w| w.loaded.len())
            .unwrap_or(0)
    }

    fn is_loaded(&self, cell: &CellCoord) -> bool {
        self.worlds
            .read()
            .get(&cell.world)
            .is_some_and(|w| w.loaded.contains(&(cell.x, cell.z)))
    }

    fn unload_cell(&self, cell: &CellCoord) -> Result<(), EngineError> {
        self.unload_calls.lock().push(cell.clone());
        let mut worlds = self.worlds.write();
        let world = worlds
            .get_mut(&cell.world)
            .ok_or_else(|| EngineError::UnknownWorld(cell.world.clone()))?;
        let key = (cell.x, cell.z);
        if world.unload_vetoes.contains(&key) {
            return Err(EngineError::Refused {
                action: "unload",
                cell: cell.clone(),
                reason: "vetoed".to_string(),
            });
        }
        if !world.loaded.remove(&key) {
            return Err(EngineError::NotLoaded(cell.clone()));
        }
        Ok(())
    }

    fn load_cell(&self, cell: &CellCoord, generate: bool) -> Result<(), EngineError> {
        self.load_calls.lock().push(cell.clone());
        let mut worlds = self.worlds.write();
        let world = worlds
            .get_mut(&cell.world)
            .ok_or_else(|| EngineError::UnknownWorld(cell.world.clone()))?;
        let key = (cell.x, cell.z);
        if world.load_refusals.contains(&key) {
            return Err(EngineError::Refused {
                action: "load",
                cell: cell.clone(),
                reason: "refused".to_string(),
            });
        }
        if !world.generated.contains(&key) {
            if !generate {
                return Err(EngineError::Refused {
                    action: "load",
                    cell: cell.clone(),
                    reason: "not generated".to_string(),
                });
            }
            world.generated.insert(key);
        }
        world.loaded.insert(key);
        Ok(())
    }

    fn height_range(&self, _world: &WorldId) -> (i32, i32) {
        (SIM_MIN_Y, SIM_MAX_Y)
    }

    fn block_at(&self, cell: &CellCoord, local_x: u8, y: i32, local_z: u8) -> Result<Material, EngineError> {
        self.with_loaded_cell(cell, |contents| {
            contents
                .and_then(|c| c.blocks.get(&(local_x, y, local_z)).copied())
                .unwrap_or_else(|| terrain_at(y))
        })
    }

    fn resources(&self, cell: &CellCoord) -> Result<Vec<Resource>, EngineError> {
        self.with_loaded_cell(cell, |contents| {
            contents.map(|c| c.resources.clone()).unwrap_or_default()
        })
    }

    fn entities(&self, cell: &CellCoord) -> Result<Vec<EntityInfo>, EngineError> {
        self.with_loaded_cell(cell, |contents| {
            contents.map(|c| c.entities.clone()).unwrap_or_default()
        })
    }

    fn world_border(&self, world: &WorldId) -> Option<WorldBorder> {
        self.worlds.read().get(world).and_then(|w| w.border)
    }

    fn supports_region_threading(&self) -> bool {
        self.region_threading
    }

    fn broadcast(&self, message: &str) {
        self.broadcasts.lock().push(message.to_string());
    }
}
