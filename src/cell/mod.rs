//! Cell lifecycle management.
//!
//! - [`coord`]: world, cell and observer identifiers
//! - [`activity`]: per-cell activity records and the ledger that holds them
//! - [`analyzer`]: protection scans and the eviction safety predicate
//! - [`evictor`]: the eviction cycle
//! - [`prefetcher`]: movement tracking and the prefetch cycle
//! - [`stats`]: cycle reports and aggregate counters
//! - [`manager`]: facade tying the above together, plus the cycle timers

pub mod activity;
pub mod analyzer;
pub mod coord;
pub mod evictor;
pub mod manager;
pub mod prefetcher;
pub mod stats;
