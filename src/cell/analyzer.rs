//! Protection analysis: decides whether a cell holds something that must
//! keep it loaded.
//!
//! Three full scans over a cell's compact content (block entities and
//! entities) set the protection flags. A fourth, sampled scan over the block
//! grid counts distinct non-trivial materials as a cheap structure detector.
//! Scans only read; results land on the cell's [`ActivityRecord`] in one step
//! and only when every scan succeeded.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::cell::activity::{ActivityLedger, ActivityRecord, ProtectionFindings};
use crate::cell::coord::{CellCoord, CELL_SIZE};
use crate::config::ActivityConfig;
use crate::engine::clock::Millis;
use crate::engine::{EngineError, ObserverSnapshot, WorldEngine};

/// Stateless scanning routines.
#[derive(Debug, Clone)]
pub struct ProtectionAnalyzer {
    stride_xz: u8,
    stride_y: u16,
}

impl ProtectionAnalyzer {
    pub fn new(config: &ActivityConfig) -> Self {
        Self {
            stride_xz: config.diversity_stride_xz.max(1),
            stride_y: config.diversity_stride_y.max(1),
        }
    }

    /// Run every scan against `cell` without touching the ledger.
    pub fn scan(&self, engine: &dyn WorldEngine, cell: &CellCoord) -> Result<ProtectionFindings, EngineError> {
        let resources = engine.resources(cell)?;
        let entities = engine.entities(cell)?;

        Ok(ProtectionFindings {
            protected_resource: resources.iter().any(|r| r.kind.is_protected()),
            named_entity: entities.iter().any(|e| e.is_named()),
            active_power_circuit: resources.iter().any(|r| r.kind.is_active_circuit()),
            diversity_score: self.sample_diversity(engine, cell)?,
        })
    }

    /// Count distinct non-trivial materials on a strided grid.
    pub fn sample_diversity(&self, engine: &dyn WorldEngine, cell: &CellCoord) -> Result<u32, EngineError> {
        let (min_y, max_y) = engine.height_range(&cell.world);
        let mut seen = HashSet::new();

        for local_x in (0..CELL_SIZE as u8).step_by(usize::from(self.stride_xz)) {
            for local_z in (0..CELL_SIZE as u8).step_by(usize::from(self.stride_xz)) {
                for y in (min_y..max_y).step_by(usize::from(self.stride_y)) {
                    let material = engine.block_at(cell, local_x, y, local_z)?;
                    if !material.is_trivial() {
                        seen.insert(material);
                    }
                }
            }
        }

        Ok(seen.len() as u32)
    }

    /// Recompute protection data for `cell` and store it on its record.
    ///
    /// On failure the ledger is left exactly as it was (no record is created).
    pub fn analyze(
        &self,
        engine: &dyn WorldEngine,
        ledger: &ActivityLedger,
        cell: &CellCoord,
        now: Millis,
    ) -> Result<Arc<ActivityRecord>, EngineError> {
        let findings = match self.scan(engine, cell) {
            Ok(findings) => findings,
            Err(e) => {
                debug!(cell = %cell, error = %e, "Cell analysis failed");
                return Err(e);
            }
        };

        let record = ledger.get_or_create(cell, now);
        record.apply_analysis(&findings, now);
        debug!(
            cell = %cell,
            protected = findings.protected_resource,
            named = findings.named_entity,
            circuit = findings.active_power_circuit,
            diversity = findings.diversity_score,
            "Analyzed cell"
        );
        Ok(record)
    }
}

/// The eviction safety predicate shared by the scheduler and admin queries.
#[derive(Debug, Clone)]
pub struct EvictionSafety {
    analyzer: ProtectionAnalyzer,
    inactivity_threshold: Millis,
    analysis_ttl: Millis,
    diversity_threshold: u32,
    activity_radius: i32,
}

impl EvictionSafety {
    pub fn new(config: &ActivityConfig) -> Self {
        Self {
            analyzer: ProtectionAnalyzer::new(config),
            inactivity_threshold: config.inactivity_threshold(),
            analysis_ttl: config.analysis_ttl(),
            diversity_threshold: config.structure_diversity_threshold,
            activity_radius: config.player_activity_radius,
        }
    }

    pub fn analyzer(&self) -> &ProtectionAnalyzer {
        &self.analyzer
    }

    pub fn activity_radius(&self) -> i32 {
        self.activity_radius
    }

    /// Whether `cell` can be unloaded at `now`, given the observers of its world.
    ///
    /// A cell without a record is analyzed first. Any analysis failure makes
    /// the cell unsafe.
    pub fn is_safe_to_evict(
        &self,
        engine: &dyn WorldEngine,
        ledger: &ActivityLedger,
        cell: &CellCoord,
        observers: &[ObserverSnapshot],
        now: Millis,
    ) -> bool {
        let record = match ledger.get(cell) {
            Some(record) => record,
            None => match self.analyzer.analyze(engine, ledger, cell, now) {
                Ok(record) => record,
                Err(_) => return false,
            },
        };

        if record.time_since_last_activity(now) <= self.inactivity_threshold {
            return false;
        }

        if record.needs_analysis(now, self.analysis_ttl)
            && self.analyzer.analyze(engine, ledger, cell, now).is_err()
        {
            return false;
        }

        if record.is_protected() || record.diversity_score() >= self.diversity_threshold {
            return false;
        }

        !observers
            .iter()
            .any(|o| o.cell().within(cell, self.activity_radius))
    }
}
