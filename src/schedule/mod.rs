//! Cycle dispatch strategies.
//!
//! The engine either runs everything on one update loop or runs independent
//! regions on their own threads. The strategy is picked once at startup:
//!
//! - [`global`]: one loop, worlds in order
//! - [`region`]: worlds fanned out across a thread pool

pub mod global;
pub mod region;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

pub use global::GlobalLoopScheduler;
pub use region::RegionParallelScheduler;

use crate::cell::coord::WorldId;
use crate::cell::stats::PassReport;
use crate::config::SchedulerMode;
use crate::engine::WorldEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    GlobalLoop,
    RegionParallel,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::GlobalLoop => write!(f, "global-loop"),
            SchedulerKind::RegionParallel => write!(f, "region-parallel"),
        }
    }
}

/// A per-world pass of a cycle.
pub type WorldPass<'a> = dyn Fn(&WorldId) -> PassReport + Sync + 'a;

/// How cycle work is dispatched onto the engine's threads.
pub trait CycleScheduler: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    /// Run a whole cycle. Global-loop scheduling serialises cycles so that no
    /// two ever act on the world at once.
    fn run_job(&self, job: &mut dyn FnMut());

    /// Run `pass` once per world and return the reports in world order.
    fn run_worlds(&self, worlds: &[WorldId], pass: &WorldPass<'_>) -> Vec<PassReport>;
}

/// Pick the scheduler once, from configuration or by probing the engine.
pub fn select_scheduler(mode: SchedulerMode, engine: &dyn WorldEngine) -> Arc<dyn CycleScheduler> {
    let kind = match mode {
        SchedulerMode::GlobalLoop => SchedulerKind::GlobalLoop,
        SchedulerMode::RegionParallel => SchedulerKind::RegionParallel,
        SchedulerMode::Auto if engine.supports_region_threading() => SchedulerKind::RegionParallel,
        SchedulerMode::Auto => SchedulerKind::GlobalLoop,
    };
    info!(scheduler = %kind, ?mode, "Selected cycle scheduler");
    match kind {
        SchedulerKind::GlobalLoop => Arc::new(GlobalLoopScheduler::new()),
        SchedulerKind::RegionParallel => Arc::new(RegionParallelScheduler::new()),
    }
}

/// Action budget shared by every world and observer in one cycle.
#[derive(Debug)]
pub struct Budget {
    remaining: AtomicUsize,
}

impl Budget {
    pub fn new(limit: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(limit),
        }
    }

    /// Take one unit. Returns false once the budget is spent.
    pub fn try_take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Return a unit taken for an action that did not happen.
    pub fn refund(&self) {
        self.remaining.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::SimulatedEngine;

    #[test]
    fn test_budget() {
        let budget = Budget::new(2);
        assert!(budget.try_take());
        assert!(budget.try_take());
        assert!(!budget.try_take());
        assert!(budget.is_exhausted());
        budget.refund();
        assert_eq!(budget.remaining(), 1);
    }

    #[test]
    fn test_select_scheduler() {
        let plain = SimulatedEngine::new();
        let threaded = SimulatedEngine::with_region_threading();

        assert_eq!(select_scheduler(SchedulerMode::Auto, &plain).kind(), SchedulerKind::GlobalLoop);
        assert_eq!(select_scheduler(SchedulerMode::Auto, &threaded).kind(), SchedulerKind::RegionParallel);
        assert_eq!(select_scheduler(SchedulerMode::GlobalLoop, &threaded).kind(), SchedulerKind::GlobalLoop);
        assert_eq!(select_scheduler(SchedulerMode::RegionParallel, &plain).kind(), SchedulerKind::RegionParallel);
    }
}
