//! Eviction cycle: unloads idle, unprotected cells.
//!
//! Each cycle walks the enabled worlds and, per world:
//! 1. skips worlds without observers,
//! 2. skips worlds already at or below the eviction floor,
//! 3. scans loaded cells for candidates (safe to evict + eligible), stopping
//!    at the floor headroom or when the cycle budget runs out,
//! 4. re-validates each candidate right before unloading it,
//! 5. reports counts.
//!
//! Engine refusals are counted as skipped and never retried within a cycle.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace};

use crate::cell::activity::ActivityLedger;
use crate::cell::analyzer::EvictionSafety;
use crate::cell::coord::{CellCoord, WorldId};
use crate::cell::stats::{CycleKind, CycleReport, PassReport};
use crate::config::Config;
use crate::engine::clock::Millis;
use crate::engine::{ObserverSnapshot, WorldBorder, WorldEngine};
use crate::schedule::{Budget, CycleScheduler};

/// The eviction policy engine.
pub struct EvictionScheduler {
    config: Arc<Config>,
    safety: EvictionSafety,
    ledger: Arc<ActivityLedger>,
    engine: Arc<dyn WorldEngine>,
}

impl EvictionScheduler {
    pub fn new(config: Arc<Config>, ledger: Arc<ActivityLedger>, engine: Arc<dyn WorldEngine>) -> Self {
        let safety = EvictionSafety::new(&config.activity);
        Self {
            config,
            safety,
            ledger,
            engine,
        }
    }

    /// Run one eviction cycle over every enabled world.
    pub fn run_cycle(&self, scheduler: &dyn CycleScheduler, now: Millis) -> CycleReport {
        let started = Instant::now();
        let worlds: Vec<WorldId> = self
            .engine
            .worlds()
            .into_iter()
            .filter(|w| self.config.is_world_enabled(w))
            .collect();

        let budget = Budget::new(self.config.eviction.max_unloads_per_cycle);
        let passes = scheduler.run_worlds(&worlds, &|world| self.evict_world(world, &budget, now));
        let report = CycleReport::from_passes(CycleKind::Evict, &passes, started.elapsed());

        self.report(&report);
        report
    }

    /// One world's share of a cycle.
    pub fn evict_world(&self, world: &WorldId, budget: &Budget, now: Millis) -> PassReport {
        let mut pass = PassReport::default();

        let observers = self.engine.observers(world);
        if observers.is_empty() {
            trace!(world = %world, "No observers, skipping eviction");
            return pass;
        }

        let floor = self.config.eviction.min_cells_per_world;
        let loaded = self.engine.loaded_cells(world);
        if loaded.len() <= floor {
            trace!(world = %world, loaded = loaded.len(), floor, "At eviction floor");
            return pass;
        }

        let candidates = self.select_candidates(world, &loaded, &observers, budget, now, &mut pass);
        if candidates.is_empty() {
            return pass;
        }

        self.commit(world, candidates, budget, now, &mut pass);
        pass
    }

    /// Scan loaded cells in enumeration order until the floor headroom or the
    /// budget is used up. Every candidate holds one budget unit.
    fn select_candidates(
        &self,
        world: &WorldId,
        loaded: &[CellCoord],
        observers: &[ObserverSnapshot],
        budget: &Budget,
        now: Millis,
        pass: &mut PassReport,
    ) -> Vec<CellCoord> {
        let floor = self.config.eviction.min_cells_per_world;
        let border = self.engine.world_border(world);
        let mut candidates = Vec::new();

        for cell in loaded {
            let remaining_loaded = loaded.len() - candidates.len();
            if remaining_loaded <= floor || budget.is_exhausted() {
                break;
            }

            pass.cells_evaluated += 1;
            if !self.safety.is_safe_to_evict(&*self.engine, &self.ledger, cell, observers, now) {
                continue;
            }
            if !self.is_eligible(cell, observers, border.as_ref()) {
                continue;
            }
            if !budget.try_take() {
                break;
            }
            candidates.push(cell.clone());
        }

        candidates
    }

    /// Checks on top of `is_safe_to_evict`: cells near the border may skip
    /// the convergence veto when aggressive border eviction is on; everything
    /// else is vetoed when too many observers are within the wider radius.
    pub fn is_eligible(&self, cell: &CellCoord, observers: &[ObserverSnapshot], border: Option<&WorldBorder>) -> bool {
        let eviction = &self.config.eviction;

        if eviction.aggressive_border_eviction
            && border.is_some_and(|b| b.is_near_edge(cell, eviction.border_margin_cells))
        {
            return true;
        }

        let wide_radius = self.safety.activity_radius() * eviction.convergence_radius_multiplier;
        let converging = observers
            .iter()
            .filter(|o| o.cell().within(cell, wide_radius))
            .count();
        converging < eviction.convergence_observer_limit
    }

    fn commit(&self, world: &WorldId, candidates: Vec<CellCoord>, budget: &Budget, now: Millis, pass: &mut PassReport) {
        let floor = self.config.eviction.min_cells_per_world;
        let observers = self.engine.observers(world);
        let mut loaded_count = self.engine.loaded_cell_count(world);

        for cell in candidates {
            if loaded_count <= floor {
                budget.refund();
                continue;
            }

            if !self.safety.is_safe_to_evict(&*self.engine, &self.ledger, &cell, &observers, now) {
                debug!(cell = %cell, "Candidate no longer safe to evict");
                budget.refund();
                continue;
            }

            match self.engine.unload_cell(&cell) {
                Ok(()) => {
                    loaded_count -= 1;
                    pass.cells_evicted += 1;
                    pass.memory_reclaimed_bytes += self.config.eviction.estimated_cell_bytes;
                    debug!(cell = %cell, "Evicted cell");
                }
                Err(e) => {
                    pass.cells_skipped += 1;
                    budget.refund();
                    debug!(cell = %cell, error = %e, "Engine declined unload");
                }
            }
        }
    }

    fn report(&self, report: &CycleReport) {
        let eviction = &self.config.eviction;
        let evicted = report.totals.cells_evicted;

        if eviction.report_threshold > 0 && evicted >= eviction.report_threshold {
            info!(
                evicted,
                skipped = report.totals.cells_skipped,
                evaluated = report.totals.cells_evaluated,
                reclaimed_kib = report.totals.memory_reclaimed_bytes / 1024,
                "Eviction cycle complete"
            );
            if eviction.broadcast_reports {
                self.engine.broadcast(&format!(
                    "Unloaded {} idle cells (~{} KiB reclaimed)",
                    evicted,
                    report.totals.memory_reclaimed_bytes / 1024
                ));
            }
        } else {
            debug!(
                evicted,
                skipped = report.totals.cells_skipped,
                evaluated = report.totals.cells_evaluated,
                worlds = report.worlds_processed,
                "Eviction cycle complete"
            );
        }
    }
}
