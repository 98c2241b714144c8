//! Single update loop: one cycle at a time, worlds in enumeration order.

use parking_lot::Mutex;

use crate::cell::coord::WorldId;
use crate::cell::stats::PassReport;
use crate::schedule::{CycleScheduler, SchedulerKind, WorldPass};

#[derive(Debug, Default)]
pub struct GlobalLoopScheduler {
    /// Held for the duration of a cycle; stands in for the engine's update thread.
    update_loop: Mutex<()>,
}

impl GlobalLoopScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CycleScheduler for GlobalLoopScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::GlobalLoop
    }

    fn run_job(&self, job: &mut dyn FnMut()) {
        let _guard = self.update_loop.lock();
        job();
    }

    fn run_worlds(&self, worlds: &[WorldId], pass: &WorldPass<'_>) -> Vec<PassReport> {
        worlds.iter().map(pass).collect()
    }
}
