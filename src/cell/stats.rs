//! Cycle statistics.
//!
//! Counters are Prometheus collectors in a registry owned by the
//! [`Statistics`] instance, so the same numbers feed both the JSON snapshot and
//! the `/metrics` exposition.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Metrics registry error: {0}")]
    Registry(#[from] prometheus::Error),

    #[error("Metrics output is not UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Which periodic pass a cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Evict,
    Prefetch,
    Cleanup,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleKind::Evict => write!(f, "evict"),
            CycleKind::Prefetch => write!(f, "prefetch"),
            CycleKind::Cleanup => write!(f, "cleanup"),
        }
    }
}

impl FromStr for CycleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evict" | "eviction" => Ok(CycleKind::Evict),
            "prefetch" | "preload" => Ok(CycleKind::Prefetch),
            "cleanup" => Ok(CycleKind::Cleanup),
            other => Err(format!("unknown cycle kind '{other}'")),
        }
    }
}

/// Outcome of one world's share of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub cells_evaluated: u64,
    pub cells_evicted: u64,
    pub cells_preloaded: u64,
    /// Actions the engine declined.
    pub cells_skipped: u64,
    pub memory_reclaimed_bytes: u64,
    pub records_cleaned: u64,
}

impl PassReport {
    pub fn merge(&mut self, other: &PassReport) {
        self.cells_evaluated += other.cells_evaluated;
        self.cells_evicted += other.cells_evicted;
        self.cells_preloaded += other.cells_preloaded;
        self.cells_skipped += other.cells_skipped;
        self.memory_reclaimed_bytes += other.memory_reclaimed_bytes;
        self.records_cleaned += other.records_cleaned;
    }
}

/// Outcome of one full cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub kind: CycleKind,
    pub worlds_processed: usize,
    #[serde(flatten)]
    pub totals: PassReport,
    pub duration_us: u64,
}

impl CycleReport {
    pub fn from_passes(kind: CycleKind, passes: &[PassReport], duration: Duration) -> Self {
        let mut totals = PassReport::default();
        for pass in passes {
            totals.merge(pass);
        }
        Self {
            kind,
            worlds_processed: passes.len(),
            totals,
            duration_us: duration.as_micros() as u64,
        }
    }
}

/// Read-only copy of the aggregate counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub cycles_run: u64,
    pub eviction_cycles: u64,
    pub prefetch_cycles: u64,
    pub cells_evaluated: u64,
    pub cells_evicted: u64,
    pub cells_preloaded: u64,
    pub cells_skipped: u64,
    pub preload_failures: u64,
    pub memory_reclaimed_bytes: u64,
    pub records_cleaned: u64,
    pub last_cycle_duration_ms: f64,
    pub average_cycle_duration_ms: f64,
    pub max_cycle_duration_ms: f64,
}

/// Process-wide counters fed by the cycles.
pub struct Statistics {
    registry: Registry,
    cycles_run: IntCounter,
    eviction_cycles: IntCounter,
    prefetch_cycles: IntCounter,
    cells_evaluated: IntCounter,
    cells_evicted: IntCounter,
    cells_preloaded: IntCounter,
    cells_skipped: IntCounter,
    preload_failures: IntCounter,
    memory_reclaimed_bytes: IntCounter,
    records_cleaned: IntCounter,
    total_cycle_us: IntCounter,
    last_cycle_us: IntGauge,
    max_cycle_us: IntGauge,
    /// Serializes the read-compare-write on `max_cycle_us`.
    max_lock: Mutex<()>,
}

impl fmt::Debug for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statistics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, StatsError> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace("cell_steward"))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, StatsError> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace("cell_steward"))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl Statistics {
    pub fn new() -> Result<Self, StatsError> {
        let registry = Registry::new();
        Ok(Self {
            cycles_run: counter(&registry, "cycles_run_total", "Cycles of any kind completed")?,
            eviction_cycles: counter(&registry, "eviction_cycles_total", "Eviction cycles completed")?,
            prefetch_cycles: counter(&registry, "prefetch_cycles_total", "Prefetch cycles completed")?,
            cells_evaluated: counter(&registry, "cells_evaluated_total", "Cells considered by eviction or prefetch")?,
            cells_evicted: counter(&registry, "cells_evicted_total", "Cells unloaded")?,
            cells_preloaded: counter(&registry, "cells_preloaded_total", "Cells loaded ahead of observers")?,
            cells_skipped: counter(&registry, "cells_skipped_total", "Load or unload requests the engine declined")?,
            preload_failures: counter(&registry, "preload_failures_total", "Load requests the engine declined")?,
            memory_reclaimed_bytes: counter(&registry, "memory_reclaimed_bytes_total", "Estimated bytes freed by unloads")?,
            records_cleaned: counter(&registry, "records_cleaned_total", "Stale activity records removed")?,
            total_cycle_us: counter(&registry, "cycle_duration_microseconds_total", "Total time spent in cycles")?,
            last_cycle_us: gauge(&registry, "last_cycle_duration_microseconds", "Duration of the most recent cycle")?,
            max_cycle_us: gauge(&registry, "max_cycle_duration_microseconds", "Longest cycle observed")?,
            max_lock: Mutex::new(()),
            registry,
        })
    }

    /// Fold a finished cycle into the counters.
    pub fn record_cycle(&self, report: &CycleReport) {
        let totals = &report.totals;
        self.cycles_run.inc();
        match report.kind {
            CycleKind::Evict => self.eviction_cycles.inc(),
            CycleKind::Prefetch => {
                self.prefetch_cycles.inc();
                self.preload_failures.inc_by(totals.cells_skipped);
            }
            CycleKind::Cleanup => {}
        }
        self.cells_evaluated.inc_by(totals.cells_evaluated);
        self.cells_evicted.inc_by(totals.cells_evicted);
        self.cells_preloaded.inc_by(totals.cells_preloaded);
        self.cells_skipped.inc_by(totals.cells_skipped);
        self.memory_reclaimed_bytes.inc_by(totals.memory_reclaimed_bytes);
        self.records_cleaned.inc_by(totals.records_cleaned);

        let micros = report.duration_us as i64;
        self.total_cycle_us.inc_by(report.duration_us);
        self.last_cycle_us.set(micros);
        let _guard = self.max_lock.lock();
        if micros > self.max_cycle_us.get() {
            self.max_cycle_us.set(micros);
        }
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let cycles = self.cycles_run.get();
        let average_us = if cycles == 0 {
            0.0
        } else {
            self.total_cycle_us.get() as f64 / cycles as f64
        };
        StatisticsSnapshot {
            cycles_run: cycles,
            eviction_cycles: self.eviction_cycles.get(),
            prefetch_cycles: self.prefetch_cycles.get(),
            cells_evaluated: self.cells_evaluated.get(),
            cells_evicted: self.cells_evicted.get(),
            cells_preloaded: self.cells_preloaded.get(),
            cells_skipped: self.cells_skipped.get(),
            preload_failures: self.preload_failures.get(),
            memory_reclaimed_bytes: self.memory_reclaimed_bytes.get(),
            records_cleaned: self.records_cleaned.get(),
            last_cycle_duration_ms: self.last_cycle_us.get() as f64 / 1_000.0,
            average_cycle_duration_ms: average_us / 1_000.0,
            max_cycle_duration_ms: self.max_cycle_us.get() as f64 / 1_000.0,
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.cycles_run,
            &self.eviction_cycles,
            &self.prefetch_cycles,
            &self.cells_evaluated,
            &self.cells_evicted,
            &self.cells_preloaded,
            &self.cells_skipped,
            &self.preload_failures,
            &self.memory_reclaimed_bytes,
            &self.records_cleaned,
            &self.total_cycle_us,
        ] {
            counter.reset();
        }
        self.last_cycle_us.set(0);
        let _guard = self.max_lock.lock();
        self.max_cycle_us.set(0);
    }

    /// Prometheus text exposition of every counter.
    pub fn render_prometheus(&self) -> Result<String, StatsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
