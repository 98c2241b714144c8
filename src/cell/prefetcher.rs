//! Prefetching: loads cells ahead of observers before they arrive.
//!
//! Each cycle, per observer:
//! 1. refresh its movement state (speed, heading),
//! 2. weight the square neighbourhood by how well each offset lines up with
//!    the heading, or fall back to nearest-first when it is not moving,
//! 3. drop cells that are already loaded,
//! 4. issue loads until the cycle budget runs out.
//!
//! The budget is shared by every observer in every world, so observers
//! processed first in a cycle get priority.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::cell::activity::ActivityLedger;
use crate::cell::coord::{CellCoord, ObserverId, Position, WorldId};
use crate::cell::stats::{CycleKind, CycleReport, PassReport};
use crate::config::{Config, PrefetchConfig};
use crate::engine::clock::Millis;
use crate::engine::WorldEngine;
use crate::schedule::{Budget, CycleScheduler};

/// Last known movement of one observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObserverMovementState {
    pub world: WorldId,
    pub last_position: Position,
    /// Unit vector on the (x, z) plane. (0, 0) until the observer first moves.
    pub direction: (f64, f64),
    /// Blocks per second over the last update.
    pub speed: f64,
    pub last_update_time: Millis,
    /// Set only while the speed is high enough and a heading is known.
    pub is_moving: bool,
    /// Position the heading is measured from. Advanced whenever the heading
    /// is refreshed.
    #[serde(skip)]
    pub heading_origin: Position,
}

impl ObserverMovementState {
    fn first_sighting(world: WorldId, position: Position, now: Millis) -> Self {
        Self {
            world,
            last_position: position,
            direction: (0.0, 0.0),
            speed: 0.0,
            last_update_time: now,
            is_moving: false,
            heading_origin: position,
        }
    }

    pub fn has_heading(&self) -> bool {
        self.direction != (0.0, 0.0)
    }

    fn advance(&mut self, world: &WorldId, position: Position, now: Millis, config: &PrefetchConfig) {
        if &self.world != world {
            *self = Self::first_sighting(world.clone(), position, now);
            return;
        }
        if now <= self.last_update_time {
            return;
        }

        let elapsed_secs = (now - self.last_update_time) as f64 / 1000.0;
        let (dx, dz) = position.horizontal_delta(&self.last_position);
        self.speed = dx.hypot(dz) / elapsed_secs;

        let (hx, hz) = position.horizontal_delta(&self.heading_origin);
        let travelled = hx.hypot(hz);
        if travelled > config.movement_noise_floor {
            self.direction = (hx / travelled, hz / travelled);
            self.heading_origin = position;
        }
        self.is_moving = self.speed >= config.min_movement_speed && self.has_heading();
        self.last_position = position;
        self.last_update_time = now;
    }
}

/// Movement state of every observer seen recently.
#[derive(Debug, Default)]
pub struct MovementTracker {
    states: DashMap<ObserverId, ObserverMovementState>,
}

impl MovementTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a position sample and return the updated state.
    pub fn observe(
        &self,
        id: ObserverId,
        world: &WorldId,
        position: Position,
        now: Millis,
        config: &PrefetchConfig,
    ) -> ObserverMovementState {
        let mut entry = self
            .states
            .entry(id)
            .or_insert_with(|| ObserverMovementState::first_sighting(world.clone(), position, now));
        entry.advance(world, position, now, config);
        entry.clone()
    }

    /// Like [`observe`](Self::observe), but leaves states that were updated
    /// less than `min_interval` ago untouched. Presence events arriving faster
    /// than the prefetch cycle then keep driving the heading.
    pub fn observe_if_stale(
        &self,
        id: ObserverId,
        world: &WorldId,
        position: Position,
        now: Millis,
        min_interval: Millis,
        config: &PrefetchConfig,
    ) -> ObserverMovementState {
        if let Some(state) = self.states.get(&id) {
            if &state.world == world && now.saturating_sub(state.last_update_time) < min_interval {
                return state.clone();
            }
        }
        self.observe(id, world, position, now, config)
    }

    pub fn get(&self, id: &ObserverId) -> Option<ObserverMovementState> {
        self.states.get(id).map(|s| s.clone())
    }

    /// Drop observers not updated within `timeout`. Returns how many were dropped.
    pub fn prune_idle(&self, now: Millis, timeout: Millis) -> usize {
        let mut removed = 0;
        self.states.retain(|_, state| {
            let keep = now.saturating_sub(state.last_update_time) <= timeout;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(removed, remaining = self.states.len(), "Pruned idle observers");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// A neighbour offset chosen for prefetching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrefetchOffset {
    pub dx: i32,
    pub dz: i32,
    /// Directional weight, or 0.0 for radial selection.
    pub priority: f64,
}

/// Cosine between the offset (dx, dz) and a unit heading.
pub fn directional_weight(dx: i32, dz: i32, direction: (f64, f64)) -> f64 {
    let (x, z) = (f64::from(dx), f64::from(dz));
    let len = x.hypot(z);
    if len == 0.0 {
        return 0.0;
    }
    (x / len) * direction.0 + (z / len) * direction.1
}

/// The prefetch policy engine.
pub struct DirectionalPrefetcher {
    config: Arc<Config>,
    ledger: Arc<ActivityLedger>,
    engine: Arc<dyn WorldEngine>,
    tracker: Arc<MovementTracker>,
}

impl DirectionalPrefetcher {
    pub fn new(
        config: Arc<Config>,
        ledger: Arc<ActivityLedger>,
        engine: Arc<dyn WorldEngine>,
        tracker: Arc<MovementTracker>,
    ) -> Self {
        Self {
            config,
            ledger,
            engine,
            tracker,
        }
    }

    /// Offsets around an observer, best first.
    ///
    /// A moving observer with a known heading (and directional mode on) only
    /// gets offsets whose weight exceeds the threshold, highest weight first.
    /// Otherwise every offset in the square is returned, nearest first.
    pub fn candidate_offsets(&self, state: &ObserverMovementState) -> Vec<PrefetchOffset> {
        let prefetch = &self.config.prefetch;
        let radius = prefetch.preload_radius;
        let directional = prefetch.directional && state.is_moving && state.has_heading();

        let mut offsets = Vec::new();
        for dx in -radius..=radius {
            for dz in -radius..=radius {
                if dx == 0 && dz == 0 {
                    continue;
                }
                if directional {
                    let priority = directional_weight(dx, dz, state.direction);
                    if priority > prefetch.directional_threshold {
                        offsets.push(PrefetchOffset { dx, dz, priority });
                    }
                } else {
                    offsets.push(PrefetchOffset { dx, dz, priority: 0.0 });
                }
            }
        }

        let nearness = |o: &PrefetchOffset| (o.dx.abs().max(o.dz.abs()), o.dx * o.dx + o.dz * o.dz);
        if directional {
            offsets.sort_by(|a, b| {
                b.priority
                    .partial_cmp(&a.priority)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| nearness(a).cmp(&nearness(b)))
            });
        } else {
            offsets.sort_by_key(nearness);
        }
        offsets
    }

    /// Run one prefetch cycle over every enabled world.
    pub fn run_cycle(&self, scheduler: &dyn CycleScheduler, now: Millis) -> CycleReport {
        let started = Instant::now();
        let worlds: Vec<WorldId> = self
            .engine
            .worlds()
            .into_iter()
            .filter(|w| self.config.is_world_enabled(w))
            .collect();

        let budget = Budget::new(self.config.prefetch.max_preloads_per_cycle);
        let passes = scheduler.run_worlds(&worlds, &|world| self.prefetch_world(world, &budget, now));

        self.tracker
            .prune_idle(now, self.config.prefetch.observer_idle_timeout());

        let report = CycleReport::from_passes(CycleKind::Prefetch, &passes, started.elapsed());
        debug!(
            preloaded = report.totals.cells_preloaded,
            failed = report.totals.cells_skipped,
            worlds = report.worlds_processed,
            "Prefetch cycle complete"
        );
        report
    }

    /// One world's share of a cycle. Observers are handled in engine order.
    pub fn prefetch_world(&self, world: &WorldId, budget: &Budget, now: Millis) -> PassReport {
        let prefetch = &self.config.prefetch;
        let mut pass = PassReport::default();

        for observer in self.engine.observers(world) {
            let state = self.tracker.observe_if_stale(
                observer.id,
                world,
                observer.position,
                now,
                prefetch.interval_ms,
                prefetch,
            );
            let center = observer.cell();
            self.ledger.record_player_visit(&center, now);

            if budget.is_exhausted() {
                trace!(observer = %observer.id, "Prefetch budget spent, deferring");
                continue;
            }

            for offset in self.candidate_offsets(&state) {
                let cell = center.offset(offset.dx, offset.dz);
                pass.cells_evaluated += 1;
                if self.engine.is_loaded(&cell) {
                    continue;
                }
                if !budget.try_take() {
                    break;
                }
                self.load(&cell, &mut pass);
            }
        }

        pass
    }

    fn load(&self, cell: &CellCoord, pass: &mut PassReport) {
        match self.engine.load_cell(cell, self.config.prefetch.generate_missing) {
            Ok(()) => {
                pass.cells_preloaded += 1;
                trace!(cell = %cell, "Preloaded cell");
            }
            Err(e) => {
                pass.cells_skipped += 1;
                debug!(cell = %cell, error = %e, "Engine declined preload");
            }
        }
    }
}
