//! cell-steward: activity-aware cell eviction and directional prefetch for
//! a voxel world simulation.
//!
//! Tracks how recently each loaded cell was touched, refuses to unload cells
//! that hold anything worth keeping, unloads the rest on a budget, and loads
//! cells ahead of moving observers.

pub mod cell;
pub mod config;
pub mod engine;
pub mod schedule;
pub mod server;
