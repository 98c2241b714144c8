//! Integration tests for the eviction cycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cell_steward::cell::coord::{CellCoord, ObserverId, Position, WorldId};
use cell_steward::cell::manager::CellManager;
use cell_steward::cell::stats::CycleKind;
use cell_steward::config::Config;
use cell_steward::engine::clock::{ManualClock, MILLIS_PER_MINUTE};
use cell_steward::engine::sim::SimulatedEngine;
use cell_steward::engine::{
    EngineError, EntityInfo, Material, ObserverSnapshot, Resource, ResourceKind, WorldBorder, WorldEngine,
};
use cell_steward::schedule::{CycleScheduler, GlobalLoopScheduler, RegionParallelScheduler};

fn world() -> WorldId {
    WorldId::new("overworld")
}

/// An observer parked far away from everything under test.
fn park_observer(engine: &SimulatedEngine, world: &WorldId) -> ObserverId {
    let id = ObserverId::new_random();
    engine.set_observer(id, world, Position::new(10_000.0, 64.0, 10_000.0));
    id
}

fn manager_with(
    config: Config,
    engine: &Arc<SimulatedEngine>,
    clock: &Arc<ManualClock>,
    scheduler: Arc<dyn CycleScheduler>,
) -> CellManager {
    CellManager::with_scheduler(Arc::new(config), engine.clone(), clock.clone(), scheduler).unwrap()
}

/// Record an old visit on every loaded cell so they all count as idle.
fn age_all_cells(manager: &CellManager, engine: &SimulatedEngine, world: &WorldId) {
    for cell in engine.loaded_cells(world) {
        manager.record_player_visit(&cell, 0);
    }
}

#[test]
fn test_floor_holds_across_cycles() {
    let engine = Arc::new(SimulatedEngine::new());
    let clock = Arc::new(ManualClock::new(0));
    let mut config = Config::default();
    config.eviction.min_cells_per_world = 50;

    // 49 + 2 = 51 loaded cells.
    engine.preload_square(&world(), 0, 0, 3);
    engine.preload(&CellCoord::new(world(), 20, 20));
    engine.preload(&CellCoord::new(world(), 21, 20));
    park_observer(&engine, &world());

    let manager = manager_with(config, &engine, &clock, Arc::new(GlobalLoopScheduler::new()));

    // Only (20, 20) has an old enough record; every other cell gets a fresh
    // record when first analyzed and sits out its grace period.
    let idle = CellCoord::new(world(), 20, 20);
    manager.record_player_visit(&idle, 0);
    clock.set(10 * MILLIS_PER_MINUTE);

    let first = manager.trigger_cycle(CycleKind::Evict);
    assert_eq!(first.totals.cells_evicted, 1);
    assert_eq!(engine.loaded_cell_count(&world()), 50);
    assert!(!engine.is_loaded(&idle));

    // Everything is idle now, but the floor is reached.
    clock.set(60 * MILLIS_PER_MINUTE);
    let second = manager.trigger_cycle(CycleKind::Evict);
    assert_eq!(second.totals.cells_evicted, 0);
    assert_eq!(second.totals.cells_evaluated, 0);
    assert_eq!(engine.loaded_cell_count(&world()), 50);
}

#[test]
fn test_floor_caps_candidates() {
    let engine = Arc::new(SimulatedEngine::new());
    let clock = Arc::new(ManualClock::new(0));
    let mut config = Config::default();
    config.eviction.min_cells_per_world = 45;

    engine.preload_square(&world(), 0, 0, 3);
    park_observer(&engine, &world());
    let manager = manager_with(config, &engine, &clock, Arc::new(GlobalLoopScheduler::new()));
    age_all_cells(&manager, &engine, &world());
    clock.set(30 * MILLIS_PER_MINUTE);

    let report = manager.trigger_cycle(CycleKind::Evict);
    assert_eq!(report.totals.cells_evicted, 4);
    assert_eq!(engine.loaded_cell_count(&world()), 45);
}

#[test]
fn test_budget_limits_unloads() {
    let engine = Arc::new(SimulatedEngine::new());
    let clock = Arc::new(ManualClock::new(0));
    let mut config = Config::default();
    config.eviction.min_cells_per_world = 0;
    config.eviction.max_unloads_per_cycle = 3;

    engine.preload_square(&world(), 0, 0, 3);
    park_observer(&engine, &world());
    let manager = manager_with(config, &engine, &clock, Arc::new(GlobalLoopScheduler::new()));
    age_all_cells(&manager, &engine, &world());
    clock.set(30 * MILLIS_PER_MINUTE);

    let report = manager.trigger_cycle(CycleKind::Evict);
    assert_eq!(report.totals.cells_evicted, 3);
    assert_eq!(report.totals.cells_evaluated, 3);
    assert_eq!(engine.loaded_cell_count(&world()), 46);

    // Cells are taken in enumeration order.
    let unloaded = engine.unload_calls();
    assert_eq!(unloaded[0], CellCoord::new(world(), -3, -3));
    assert_eq!(unloaded[2], CellCoord::new(world(), -3, -1));
}

#[test]
fn test_budget_is_shared_across_worlds() {
    let engine = Arc::new(SimulatedEngine::with_region_threading());
    let clock = Arc::new(ManualClock::new(0));
    let mut config = Config::default();
    config.eviction.min_cells_per_world = 0;
    config.eviction.max_unloads_per_cycle = 5;

    let worlds = [WorldId::new("a"), WorldId::new("b"), WorldId::new("c")];
    for w in &worlds {
        engine.preload_square(w, 0, 0, 2);
        park_observer(&engine, w);
    }
    let manager = manager_with(config, &engine, &clock, Arc::new(RegionParallelScheduler::new()));
    for w in &worlds {
        age_all_cells(&manager, &engine, w);
    }
    clock.set(30 * MILLIS_PER_MINUTE);

    let report = manager.trigger_cycle(CycleKind::Evict);
    assert_eq!(report.worlds_processed, 3);
    assert_eq!(report.totals.cells_evicted, 5);
    let remaining: usize = worlds.iter().map(|w| engine.loaded_cell_count(w)).sum();
    assert_eq!(remaining, 75 - 5);
}

#[test]
fn test_protected_cells_survive() {
    let engine = Arc::new(SimulatedEngine::new());
    let clock = Arc::new(ManualClock::new(0));
    let mut config = Config::default();
    config.eviction.min_cells_per_world = 0;

    engine.preload_square(&world(), 0, 0, 1);
    park_observer(&engine, &world());

    let chest = CellCoord::new(world(), -1, -1);
    let pet = CellCoord::new(world(), -1, 0);
    let redstone = CellCoord::new(world(), -1, 1);
    let base = CellCoord::new(world(), 0, -1);
    engine.add_resource(&chest, ResourceKind::Chest);
    engine.add_entity(
        &pet,
        EntityInfo {
            kind: "wolf".to_string(),
            custom_name: Some("Rex".to_string()),
            persistent: true,
        },
    );
    engine.add_resource(&redstone, ResourceKind::Circuit { powered: true });
    for n in 0..12u16 {
        let lx = (n % 4) as u8 * 4;
        let lz = (n / 4) as u8 * 4;
        engine.set_block(&base, lx, 64, lz, Material::Other(100 + n));
    }

    let manager = manager_with(config, &engine, &clock, Arc::new(GlobalLoopScheduler::new()));
    age_all_cells(&manager, &engine, &world());
    clock.set(30 * MILLIS_PER_MINUTE);

    let report = manager.trigger_cycle(CycleKind::Evict);
    assert_eq!(report.totals.cells_evicted, 5);
    for kept in [&chest, &pet, &redstone, &base] {
        assert!(engine.is_loaded(kept), "{kept} should stay loaded");
    }
    assert!(manager.get_activity(&base).unwrap().content_diversity_score >= 12);
}

#[test]
fn test_cells_near_observers_survive() {
    let engine = Arc::new(SimulatedEngine::new());
    let clock = Arc::new(ManualClock::new(0));
    let mut config = Config::default();
    config.eviction.min_cells_per_world = 0;
    config.eviction.max_unloads_per_cycle = 100;

    engine.preload_square(&world(), 0, 0, 6);
    // Standing in cell (0, 0); default activity radius is 4.
    engine.set_observer(ObserverId::new_random(), &world(), Position::new(8.0, 64.0, 8.0));

    let manager = manager_with(config, &engine, &clock, Arc::new(GlobalLoopScheduler::new()));
    age_all_cells(&manager, &engine, &world());
    clock.set(30 * MILLIS_PER_MINUTE);

    let report = manager.trigger_cycle(CycleKind::Evict);
    // 13x13 minus the 9x9 square around the observer.
    assert_eq!(report.totals.cells_evicted, 169 - 81);
    assert!(engine.is_loaded(&CellCoord::new(world(), 4, -4)));
    assert!(!engine.is_loaded(&CellCoord::new(world(), 5, 0)));
}

#[test]
fn test_converging_observers_veto_wider_area() {
    let engine = Arc::new(SimulatedEngine::new());
    let clock = Arc::new(ManualClock::new(0));
    let mut config = Config::default();
    config.eviction.min_cells_per_world = 0;
    config.eviction.max_unloads_per_cycle = 100;

    engine.preload_square(&world(), 20, 0, 3);
    // Two observers 12 cells to the west of the block; veto radius is 8.
    engine.set_observer(ObserverId::new_random(), &world(), Position::new(8.0 * 16.0 + 8.0, 64.0, 8.0));
    engine.set_observer(ObserverId::new_random(), &world(), Position::new(8.0 * 16.0 + 8.0, 64.0, 24.0));

    let manager = manager_with(config, &engine, &clock, Arc::new(GlobalLoopScheduler::new()));
    age_all_cells(&manager, &engine, &world());
    clock.set(30 * MILLIS_PER_MINUTE);

    manager.trigger_cycle(CycleKind::Evict);
    // Column x = 17 is 9 cells away and goes; x = 16 would be inside the veto.
    assert!(!engine.is_loaded(&CellCoord::new(world(), 17, 0)));
    assert_eq!(engine.loaded_cell_count(&world()), 0);

    // A fresh block right next to both observers: outside the activity radius
    // (5..) but inside the veto radius (..8), so nothing is evicted.
    engine.preload_square(&world(), 14, 0, 1);
    age_all_cells(&manager, &engine, &world());
    clock.set(90 * MILLIS_PER_MINUTE);
    let report = manager.trigger_cycle(CycleKind::Evict);
    assert_eq!(report.totals.cells_evicted, 0);
    assert_eq!(engine.loaded_cell_count(&world()), 9);
}

#[test]
fn test_aggressive_border_eviction_ignores_convergence() {
    let engine = Arc::new(SimulatedEngine::new());
    let clock = Arc::new(ManualClock::new(0));
    let mut config = Config::default();
    config.eviction.min_cells_per_world = 0;
    config.eviction.aggressive_border_eviction = true;

    // Border edges at +/-160 blocks, i.e. cells -10 and 10.
    engine.set_border(
        &world(),
        WorldBorder {
            center_x: 0.0,
            center_z: 0.0,
            radius: 160.0,
        },
    );
    let edge = CellCoord::new(world(), 9, 0);
    let inner = CellCoord::new(world(), 0, 0);
    engine.preload(&edge);
    engine.preload(&inner);
    // Cells (5, 5) and (4, -5): 5 cells from both targets, so outside the
    // activity radius and inside the veto radius.
    engine.set_observer(ObserverId::new_random(), &world(), Position::new(88.0, 64.0, 88.0));
    engine.set_observer(ObserverId::new_random(), &world(), Position::new(72.0, 64.0, -72.0));

    let manager = manager_with(config, &engine, &clock, Arc::new(GlobalLoopScheduler::new()));
    age_all_cells(&manager, &engine, &world());
    clock.set(30 * MILLIS_PER_MINUTE);

    let report = manager.trigger_cycle(CycleKind::Evict);
    assert_eq!(report.totals.cells_evicted, 1);
    assert!(!engine.is_loaded(&edge));
    assert!(engine.is_loaded(&inner));
}

#[test]
fn test_scan_failure_keeps_cell_and_record_untouched() {
    let engine = Arc::new(SimulatedEngine::new());
    let clock = Arc::new(ManualClock::new(0));
    let mut config = Config::default();
    config.eviction.min_cells_per_world = 0;

    let broken = CellCoord::new(world(), 3, 3);
    engine.preload(&broken);
    engine.fail_scans(&broken);
    park_observer(&engine, &world());

    let manager = manager_with(config, &engine, &clock, Arc::new(GlobalLoopScheduler::new()));
    clock.set(30 * MILLIS_PER_MINUTE);

    let report = manager.trigger_cycle(CycleKind::Evict);
    assert_eq!(report.totals.cells_evaluated, 1);
    assert_eq!(report.totals.cells_evicted, 0);
    assert!(engine.is_loaded(&broken));
    assert!(manager.get_activity(&broken).is_none());
}

#[test]
fn test_statistics_accumulate() {
    let engine = Arc::new(SimulatedEngine::new());
    let clock = Arc::new(ManualClock::new(0));
    let mut config = Config::default();
    config.eviction.min_cells_per_world = 0;
    config.eviction.max_unloads_per_cycle = 4;

    engine.preload_square(&world(), 0, 0, 2);
    park_observer(&engine, &world());
    let manager = manager_with(config, &engine, &clock, Arc::new(GlobalLoopScheduler::new()));
    age_all_cells(&manager, &engine, &world());
    clock.set(30 * MILLIS_PER_MINUTE);

    manager.trigger_cycle(CycleKind::Evict);
    manager.trigger_cycle(CycleKind::Evict);

    let stats = manager.get_statistics();
    assert_eq!(stats.cycles_run, 2);
    assert_eq!(stats.eviction_cycles, 2);
    assert_eq!(stats.cells_evicted, 8);
    assert_eq!(stats.memory_reclaimed_bytes, 8 * 64 * 1024);
    assert!(stats.max_cycle_duration_ms >= stats.average_cycle_duration_ms);
}

/// Delegates to a [`SimulatedEngine`], but from the second `observers` call
/// for `world` on, reports an extra observer standing in `arrival`.
struct LateArrivalEngine {
    inner: Arc<SimulatedEngine>,
    world: WorldId,
    arrival: CellCoord,
    calls: AtomicUsize,
}

impl WorldEngine for LateArrivalEngine {
    fn worlds(&self) -> Vec<WorldId> {
        self.inner.worlds()
    }

    fn observers(&self, world: &WorldId) -> Vec<ObserverSnapshot> {
        let mut observers = self.inner.observers(world);
        if world == &self.world && self.calls.fetch_add(1, Ordering::SeqCst) >= 1 {
            observers.push(ObserverSnapshot {
                id: ObserverId::new_random(),
                world: world.clone(),
                position: Position::new(
                    f64::from(self.arrival.x * 16 + 8),
                    64.0,
                    f64::from(self.arrival.z * 16 + 8),
                ),
            });
        }
        observers
    }

    fn loaded_cells(&self, world: &WorldId) -> Vec<CellCoord> {
        self.inner.loaded_cells(world)
    }

    fn is_loaded(&self, cell: &CellCoord) -> bool {
        self.inner.is_loaded(cell)
    }

    fn unload_cell(&self, cell: &CellCoord) -> Result<(), EngineError> {
        self.inner.unload_cell(cell)
    }

    fn load_cell(&self, cell: &CellCoord, generate: bool) -> Result<(), EngineError> {
        self.inner.load_cell(cell, generate)
    }

    fn height_range(&self, world: &WorldId) -> (i32, i32) {
        self.inner.height_range(world)
    }

    fn block_at(&self, cell: &CellCoord, local_x: u8, y: i32, local_z: u8) -> Result<Material, EngineError> {
        self.inner.block_at(cell, local_x, y, local_z)
    }

    fn resources(&self, cell: &CellCoord) -> Result<Vec<Resource>, EngineError> {
        self.inner.resources(cell)
    }

    fn entities(&self, cell: &CellCoord) -> Result<Vec<EntityInfo>, EngineError> {
        self.inner.entities(cell)
    }
}

#[test]
fn test_observer_arriving_after_scan_blocks_unload_and_refunds_budget() {
    let sim = Arc::new(SimulatedEngine::new());
    let clock = Arc::new(ManualClock::new(0));
    let mut config = Config::default();
    config.eviction.min_cells_per_world = 0;
    config.eviction.max_unloads_per_cycle = 1;

    // "a" runs before "b" under the global loop.
    let first = WorldId::new("a");
    let second = WorldId::new("b");
    let target = CellCoord::new(first.clone(), 0, 0);
    sim.preload(&target);
    park_observer(&sim, &first);
    sim.preload_square(&second, 0, 0, 1);
    park_observer(&sim, &second);

    let engine = Arc::new(LateArrivalEngine {
        inner: sim.clone(),
        world: first.clone(),
        arrival: target.clone(),
        calls: AtomicUsize::new(0),
    });
    let manager = CellManager::with_scheduler(
        Arc::new(config),
        engine,
        clock.clone(),
        Arc::new(GlobalLoopScheduler::new()),
    )
    .unwrap();
    age_all_cells(&manager, &sim, &first);
    age_all_cells(&manager, &sim, &second);
    clock.set(30 * MILLIS_PER_MINUTE);

    let report = manager.trigger_cycle(CycleKind::Evict);

    // The target was a candidate but the commit-time check saw the newcomer.
    assert!(sim.is_loaded(&target));
    assert!(!sim.unload_calls().contains(&target));
    // Its budget unit went back and was spent in the next world.
    assert_eq!(report.totals.cells_evicted, 1);
    assert_eq!(sim.loaded_cell_count(&second), 8);
}
