//! Per-cell activity records and the ledger that owns them.
//!
//! Records are created lazily on the first observed signal (or first
//! analysis) and only ever removed by the staleness sweep. Every field is an
//! independent atomic: timestamps only move forward (`fetch_max`), counters
//! only grow, and protection flags are overwritten wholesale by analysis.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::cell::coord::{CellCoord, WorldId};
use crate::engine::clock::Millis;

/// Activity and protection metadata for a single cell.
#[derive(Debug)]
pub struct ActivityRecord {
    creation_time: Millis,

    last_player_visit: AtomicU64,
    player_visit_count: AtomicU64,

    last_modification: AtomicU64,
    modification_count: AtomicU64,

    last_entity_activity: AtomicU64,

    has_protected_resource: AtomicBool,
    has_named_entity: AtomicBool,
    has_active_power_circuit: AtomicBool,
    content_diversity_score: AtomicU32,

    /// Whether `analyze` has ever completed for this record.
    analyzed: AtomicBool,
    last_analysis: AtomicU64,
}

impl ActivityRecord {
    pub fn new(now: Millis) -> Self {
        Self {
            creation_time: now,
            last_player_visit: AtomicU64::new(0),
            player_visit_count: AtomicU64::new(0),
            last_modification: AtomicU64::new(0),
            modification_count: AtomicU64::new(0),
            last_entity_activity: AtomicU64::new(0),
            has_protected_resource: AtomicBool::new(false),
            has_named_entity: AtomicBool::new(false),
            has_active_power_circuit: AtomicBool::new(false),
            content_diversity_score: AtomicU32::new(0),
            analyzed: AtomicBool::new(false),
            last_analysis: AtomicU64::new(0),
        }
    }

    pub fn creation_time(&self) -> Millis {
        self.creation_time
    }

    pub fn touch_player_visit(&self, at: Millis) {
        self.last_player_visit.fetch_max(at, Ordering::Relaxed);
        self.player_visit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch_modification(&self, at: Millis) {
        self.last_modification.fetch_max(at, Ordering::Relaxed);
        self.modification_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch_entity_activity(&self, at: Millis) {
        self.last_entity_activity.fetch_max(at, Ordering::Relaxed);
    }

    /// Most recent of the creation time and every activity timestamp.
    pub fn last_activity(&self) -> Millis {
        self.creation_time
            .max(self.last_player_visit.load(Ordering::Relaxed))
            .max(self.last_modification.load(Ordering::Relaxed))
            .max(self.last_entity_activity.load(Ordering::Relaxed))
    }

    pub fn time_since_last_activity(&self, now: Millis) -> Millis {
        now.saturating_sub(self.last_activity())
    }

    pub fn age(&self, now: Millis) -> Millis {
        now.saturating_sub(self.creation_time)
    }

    pub fn is_protected(&self) -> bool {
        self.has_protected_resource.load(Ordering::Relaxed)
            || self.has_named_entity.load(Ordering::Relaxed)
            || self.has_active_power_circuit.load(Ordering::Relaxed)
    }

    pub fn diversity_score(&self) -> u32 {
        self.content_diversity_score.load(Ordering::Relaxed)
    }

    /// Whether the protection data is missing or older than `ttl`.
    pub fn needs_analysis(&self, now: Millis, ttl: Millis) -> bool {
        !self.analyzed.load(Ordering::Acquire)
            || now.saturating_sub(self.last_analysis.load(Ordering::Relaxed)) > ttl
    }

    /// Store the outcome of a completed scan.
    pub fn apply_analysis(&self, findings: &ProtectionFindings, at: Millis) {
        self.has_protected_resource
            .store(findings.protected_resource, Ordering::Relaxed);
        self.has_named_entity
            .store(findings.named_entity, Ordering::Relaxed);
        self.has_active_power_circuit
            .store(findings.active_power_circuit, Ordering::Relaxed);
        self.content_diversity_score
            .store(findings.diversity_score, Ordering::Relaxed);
        self.last_analysis.fetch_max(at, Ordering::Relaxed);
        self.analyzed.store(true, Ordering::Release);
    }

    /// Plain copy of the record for reporting.
    pub fn snapshot(&self) -> ActivitySnapshot {
        ActivitySnapshot {
            creation_time: self.creation_time,
            last_player_visit: self.last_player_visit.load(Ordering::Relaxed),
            player_visit_count: self.player_visit_count.load(Ordering::Relaxed),
            last_modification: self.last_modification.load(Ordering::Relaxed),
            modification_count: self.modification_count.load(Ordering::Relaxed),
            last_entity_activity: self.last_entity_activity.load(Ordering::Relaxed),
            has_protected_resource: self.has_protected_resource.load(Ordering::Relaxed),
            has_named_entity: self.has_named_entity.load(Ordering::Relaxed),
            has_active_power_circuit: self.has_active_power_circuit.load(Ordering::Relaxed),
            content_diversity_score: self.content_diversity_score.load(Ordering::Relaxed),
            analyzed: self.analyzed.load(Ordering::Relaxed),
            last_analysis: self.last_analysis.load(Ordering::Relaxed),
        }
    }
}

/// Result of a protection scan, applied to a record in one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtectionFindings {
    pub protected_resource: bool,
    pub named_entity: bool,
    pub active_power_circuit: bool,
    pub diversity_score: u32,
}

/// Point-in-time copy of an [`ActivityRecord`]. Timestamps of 0 mean "never".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivitySnapshot {
    pub creation_time: Millis,
    pub last_player_visit: Millis,
    pub player_visit_count: u64,
    pub last_modification: Millis,
    pub modification_count: u64,
    pub last_entity_activity: Millis,
    pub has_protected_resource: bool,
    pub has_named_entity: bool,
    pub has_active_power_circuit: bool,
    pub content_diversity_score: u32,
    pub analyzed: bool,
    pub last_analysis: Millis,
}

/// Concurrent map from cell to activity record.
///
/// Records are handed out as `Arc`s so callers never hold a shard lock while
/// talking to the engine.
#[derive(Debug, Default)]
pub struct ActivityLedger {
    records: DashMap<CellCoord, Arc<ActivityRecord>>,
}

impl ActivityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the record for `cell`, creating it with `creation_time = now`.
    pub fn get_or_create(&self, cell: &CellCoord, now: Millis) -> Arc<ActivityRecord> {
        if let Some(record) = self.records.get(cell) {
            return Arc::clone(record.value());
        }
        Arc::clone(
            self.records
                .entry(cell.clone())
                .or_insert_with(|| Arc::new(ActivityRecord::new(now)))
                .value(),
        )
    }

    pub fn get(&self, cell: &CellCoord) -> Option<Arc<ActivityRecord>> {
        self.records.get(cell).map(|r| Arc::clone(r.value()))
    }

    pub fn snapshot(&self, cell: &CellCoord) -> Option<ActivitySnapshot> {
        self.records.get(cell).map(|r| r.snapshot())
    }

    pub fn record_player_visit(&self, cell: &CellCoord, at: Millis) {
        self.get_or_create(cell, at).touch_player_visit(at);
    }

    pub fn record_modification(&self, cell: &CellCoord, at: Millis) {
        self.get_or_create(cell, at).touch_modification(at);
    }

    pub fn record_entity_activity(&self, cell: &CellCoord, at: Millis) {
        self.get_or_create(cell, at).touch_entity_activity(at);
    }

    /// Drop every record created more than `max_age` ago, protected or not.
    ///
    /// Returns the number of records removed.
    pub fn cleanup_stale(&self, now: Millis, max_age: Millis) -> usize {
        let mut removed = 0;
        self.records.retain(|_, record| {
            let keep = record.age(now) <= max_age;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "Removed stale activity records");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records held for one world.
    pub fn count_in_world(&self, world: &WorldId) -> usize {
        self.records.iter().filter(|r| &r.key().world == world).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(x: i32, z: i32) -> CellCoord {
        CellCoord::new(WorldId::new("w"), x, z)
    }

    #[test]
    fn test_record_created_lazily() {
        let ledger = ActivityLedger::new();
        assert!(ledger.get(&cell(0, 0)).is_none());

        ledger.record_player_visit(&cell(0, 0), 1_000);
        let snap = ledger.snapshot(&cell(0, 0)).unwrap();
        assert_eq!(snap.creation_time, 1_000);
        assert_eq!(snap.last_player_visit, 1_000);
        assert_eq!(snap.player_visit_count, 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_timestamps_never_move_backwards() {
        let ledger = ActivityLedger::new();
        ledger.record_modification(&cell(1, 1), 5_000);
        ledger.record_modification(&cell(1, 1), 3_000);

        let snap = ledger.snapshot(&cell(1, 1)).unwrap();
        assert_eq!(snap.last_modification, 5_000);
        assert_eq!(snap.modification_count, 2);
    }

    #[test]
    fn test_last_activity_is_max_of_all_timestamps() {
        let record = ActivityRecord::new(100);
        assert_eq!(record.last_activity(), 100);

        record.touch_player_visit(400);
        record.touch_entity_activity(900);
        record.touch_modification(600);
        assert_eq!(record.last_activity(), 900);
        assert_eq!(record.time_since_last_activity(1_000), 100);
        assert_eq!(record.time_since_last_activity(50), 0);
    }

    #[test]
    fn test_analysis_overwrites_flags() {
        let record = ActivityRecord::new(0);
        assert!(record.needs_analysis(0, 1_000));

        let findings = ProtectionFindings {
            named_entity: true,
            diversity_score: 7,
            ..Default::default()
        };
        record.apply_analysis(&findings, 10);
        assert!(record.is_protected());
        assert_eq!(record.diversity_score(), 7);
        assert!(!record.needs_analysis(500, 1_000));
        assert!(record.needs_analysis(2_000, 1_000));

        record.apply_analysis(&ProtectionFindings::default(), 2_000);
        assert!(!record.is_protected());
    }

    #[test]
    fn test_cleanup_stale_ignores_protection() {
        let ledger = ActivityLedger::new();
        ledger.record_player_visit(&cell(0, 0), 0);
        ledger.record_player_visit(&cell(1, 0), 50_000);
        ledger
            .get(&cell(0, 0))
            .unwrap()
            .apply_analysis(&ProtectionFindings { protected_resource: true, ..Default::default() }, 0);

        let removed = ledger.cleanup_stale(60_000, 30_000);
        assert_eq!(removed, 1);
        assert!(ledger.get(&cell(0, 0)).is_none());
        assert!(ledger.get(&cell(1, 0)).is_some());
    }

    #[test]
    fn test_cleanup_count_exact_under_concurrent_inserts() {
        let ledger = ActivityLedger::new();
        for x in 0..100 {
            ledger.record_player_visit(&cell(x, 0), 0);
        }

        let removed = std::thread::scope(|s| {
            s.spawn(|| {
                for x in 0..2_000 {
                    ledger.record_modification(&cell(x, 1), 60_000);
                }
            });
            s.spawn(|| ledger.cleanup_stale(60_000, 30_000)).join().unwrap()
        });

        assert_eq!(removed, 100);
        assert_eq!(ledger.count_in_world(&WorldId::new("w")), 2_000);
    }
}
