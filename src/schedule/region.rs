//! Region-parallel dispatch: each world's pass runs on the rayon pool.
//!
//! Cycles are not serialised against each other; the engine is expected to
//! order mutations per region itself.

use rayon::prelude::*;

use crate::cell::coord::WorldId;
use crate::cell::stats::PassReport;
use crate::schedule::{CycleScheduler, SchedulerKind, WorldPass};

#[derive(Debug, Default)]
pub struct RegionParallelScheduler;

impl RegionParallelScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl CycleScheduler for RegionParallelScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::RegionParallel
    }

    fn run_job(&self, job: &mut dyn FnMut()) {
        job();
    }

    fn run_worlds(&self, worlds: &[WorldId], pass: &WorldPass<'_>) -> Vec<PassReport> {
        // Indexed parallel collect keeps world order.
        worlds.par_iter().map(pass).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_keep_world_order() {
        let scheduler = RegionParallelScheduler::new();
        let worlds: Vec<WorldId> = (0..16).map(|i| WorldId::new(format!("w{i}"))).collect();

        let reports = scheduler.run_worlds(&worlds, &|world| PassReport {
            cells_evaluated: world.as_str()[1..].parse().unwrap(),
            ..Default::default()
        });

        let evaluated: Vec<u64> = reports.iter().map(|r| r.cells_evaluated).collect();
        assert_eq!(evaluated, (0..16).collect::<Vec<u64>>());
    }
}
