//! Cell manager: the single entry point the host and admin tooling talk to.
//!
//! Owns the ledger, movement tracker, eviction scheduler, prefetcher and
//! statistics. The host feeds it observer presence, world modifications and
//! entity activity; it runs eviction, prefetch and cleanup cycles on timers
//! (or on demand through [`CellManager::trigger_cycle`]).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cell::activity::{ActivityLedger, ActivitySnapshot};
use crate::cell::analyzer::EvictionSafety;
use crate::cell::coord::{CellCoord, ObserverId, Position, WorldId};
use crate::cell::evictor::EvictionScheduler;
use crate::cell::prefetcher::{DirectionalPrefetcher, MovementTracker, ObserverMovementState};
use crate::cell::stats::{CycleKind, CycleReport, PassReport, Statistics, StatisticsSnapshot, StatsError};
use crate::config::Config;
use crate::engine::clock::{Clock, Millis};
use crate::engine::{EngineError, WorldEngine};
use crate::schedule::{select_scheduler, CycleScheduler, SchedulerKind};

pub struct CellManager {
    config: Arc<Config>,
    engine: Arc<dyn WorldEngine>,
    clock: Arc<dyn Clock>,
    ledger: Arc<ActivityLedger>,
    tracker: Arc<MovementTracker>,
    safety: EvictionSafety,
    evictor: EvictionScheduler,
    prefetcher: DirectionalPrefetcher,
    stats: Statistics,
    scheduler: Arc<dyn CycleScheduler>,
}

impl CellManager {
    /// Build a manager, picking the cycle scheduler from config or by probing the engine.
    pub fn new(config: Arc<Config>, engine: Arc<dyn WorldEngine>, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let scheduler = select_scheduler(config.scheduler.mode, &*engine);
        Self::with_scheduler(config, engine, clock, scheduler)
    }

    pub fn with_scheduler(
        config: Arc<Config>,
        engine: Arc<dyn WorldEngine>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn CycleScheduler>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let ledger = Arc::new(ActivityLedger::new());
        let tracker = Arc::new(MovementTracker::new());
        let evictor = EvictionScheduler::new(config.clone(), ledger.clone(), engine.clone());
        let prefetcher = DirectionalPrefetcher::new(config.clone(), ledger.clone(), engine.clone(), tracker.clone());

        Ok(Self {
            safety: EvictionSafety::new(&config.activity),
            stats: Statistics::new()?,
            config,
            engine,
            clock,
            ledger,
            tracker,
            evictor,
            prefetcher,
            scheduler,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler_kind(&self) -> SchedulerKind {
        self.scheduler.kind()
    }

    pub fn now(&self) -> Millis {
        self.clock.now_millis()
    }

    // --- Inbound signals ---

    /// An observer was seen at `position`. Updates its movement state and
    /// records a visit on the cell it stands in.
    pub fn record_presence(&self, observer: ObserverId, world: &WorldId, position: Position, at: Millis) {
        self.tracker
            .observe(observer, world, position, at, &self.config.prefetch);
        self.ledger.record_player_visit(&position.cell(world.clone()), at);
    }

    pub fn record_player_visit(&self, cell: &CellCoord, at: Millis) {
        self.ledger.record_player_visit(cell, at);
    }

    pub fn record_modification(&self, cell: &CellCoord, at: Millis) {
        self.ledger.record_modification(cell, at);
    }

    pub fn record_entity_activity(&self, cell: &CellCoord, at: Millis) {
        self.ledger.record_entity_activity(cell, at);
    }

    // --- Queries ---

    /// Whether `cell` could be unloaded right now.
    pub fn is_safe_to_evict(&self, cell: &CellCoord) -> bool {
        let observers = self.engine.observers(&cell.world);
        self.safety
            .is_safe_to_evict(&*self.engine, &self.ledger, cell, &observers, self.now())
    }

    pub fn get_activity(&self, cell: &CellCoord) -> Option<ActivitySnapshot> {
        self.ledger.snapshot(cell)
    }

    /// Force a protection analysis of `cell` and return the refreshed record.
    pub fn analyze(&self, cell: &CellCoord) -> Result<ActivitySnapshot, EngineError> {
        self.safety
            .analyzer()
            .analyze(&*self.engine, &self.ledger, cell, self.now())
            .map(|record| record.snapshot())
    }

    pub fn movement_state(&self, observer: &ObserverId) -> Option<ObserverMovementState> {
        self.tracker.get(observer)
    }

    pub fn tracked_cells(&self) -> usize {
        self.ledger.len()
    }

    pub fn tracked_observers(&self) -> usize {
        self.tracker.len()
    }

    pub fn get_statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.stats.reset();
        info!("Statistics reset");
    }

    pub fn render_metrics(&self) -> Result<String, StatsError> {
        self.stats.render_prometheus()
    }

    // --- Cycles ---

    /// Run one cycle of `kind` now and fold it into the statistics.
    pub fn trigger_cycle(&self, kind: CycleKind) -> CycleReport {
        let mut report = CycleReport::from_passes(kind, &[], Duration::ZERO);
        self.scheduler.run_job(&mut || {
            let now = self.clock.now_millis();
            report = match kind {
                CycleKind::Evict => self.evictor.run_cycle(&*self.scheduler, now),
                CycleKind::Prefetch => self.prefetcher.run_cycle(&*self.scheduler, now),
                CycleKind::Cleanup => self.cleanup(now),
            };
        });
        self.stats.record_cycle(&report);
        report
    }

    fn cleanup(&self, now: Millis) -> CycleReport {
        let started = Instant::now();
        let removed = self
            .ledger
            .cleanup_stale(now, self.config.activity.max_activity_age());
        let idle = self
            .tracker
            .prune_idle(now, self.config.prefetch.observer_idle_timeout());
        if removed > 0 || idle > 0 {
            info!(records = removed, observers = idle, "Cleaned up stale state");
        }

        let pass = PassReport {
            records_cleaned: removed as u64,
            ..Default::default()
        };
        CycleReport::from_passes(CycleKind::Cleanup, &[pass], started.elapsed())
    }

    /// Start the periodic cycles. Disabled cycles get no timer; cleanup always runs.
    pub fn start(self: &Arc<Self>) -> ServiceHandle {
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        if self.config.eviction.enabled {
            let period = Duration::from_secs(self.config.eviction.interval_secs);
            tasks.push(spawn_cycle_timer(self.clone(), CycleKind::Evict, period, rx.clone()));
        }
        if self.config.prefetch.enabled {
            let period = Duration::from_millis(self.config.prefetch.interval_ms);
            tasks.push(spawn_cycle_timer(self.clone(), CycleKind::Prefetch, period, rx.clone()));
        }
        let period = Duration::from_secs(self.config.activity.cleanup_interval_secs);
        tasks.push(spawn_cycle_timer(self.clone(), CycleKind::Cleanup, period, rx));

        info!(
            timers = tasks.len(),
            scheduler = %self.scheduler.kind(),
            "Cell manager started"
        );
        ServiceHandle { shutdown, tasks }
    }
}

/// Handle to the running cycle timers.
pub struct ServiceHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Stop every timer and wait for in-flight cycles to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Cycle timer ended abnormally");
            }
        }
        info!("Cell manager stopped");
    }
}

fn spawn_cycle_timer(
    manager: Arc<CellManager>,
    kind: CycleKind,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; cycles start one period in.
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let manager = Arc::clone(&manager);
                    match tokio::task::spawn_blocking(move || manager.trigger_cycle(kind)).await {
                        Ok(report) => debug!(
                            cycle = %kind,
                            duration_us = report.duration_us,
                            "Timed cycle finished"
                        ),
                        Err(e) => warn!(cycle = %kind, error = %e, "Cycle task failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(cycle = %kind, "Cycle timer stopped");
    })
}
