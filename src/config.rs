//! Runtime configuration for cell-steward.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every threshold, budget and heuristic constant lives here so it can be
//! tuned per deployment.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cell::coord::WorldId;
use crate::engine::clock::{Millis, MILLIS_PER_MINUTE, MILLIS_PER_SECOND};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "cell-steward", about = "Activity-aware cell eviction and directional prefetch")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Admin API listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Number of simulated observers to drive through the demo world.
    #[arg(long, default_value_t = 2)]
    pub demo_observers: usize,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must not be negative (got {value})")]
    Negative { field: &'static str, value: f64 },

    #[error("directional_threshold must be within [-1, 1] (got {0})")]
    ThresholdOutOfRange(f64),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin API settings.
    pub server: ServerConfig,

    /// Worlds the cycles act on. Empty means all worlds.
    pub enabled_worlds: Vec<String>,

    /// Activity tracking and protection analysis.
    pub activity: ActivityConfig,

    /// Eviction cycle tuning.
    pub eviction: EvictionConfig,

    /// Prefetch cycle tuning.
    pub prefetch: PrefetchConfig,

    /// Scheduling strategy.
    pub scheduler: SchedulerConfig,
}

/// Admin HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8088").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8088".to_string(),
        }
    }
}

/// Activity ledger and protection analyzer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// A cell must be idle longer than this to be evictable.
    pub inactivity_threshold_minutes: u64,

    /// Observers within this many cells (Chebyshev) keep a cell loaded.
    pub player_activity_radius: i32,

    /// Cells with at least this many distinct non-trivial materials are treated as built-up.
    pub structure_diversity_threshold: u32,

    /// Records older than this (since creation) are dropped by cleanup.
    pub max_activity_age_minutes: u64,

    /// Horizontal sampling stride for the diversity scan.
    pub diversity_stride_xz: u8,

    /// Vertical sampling stride for the diversity scan.
    pub diversity_stride_y: u16,

    /// Protection data older than this is refreshed before an eviction decision.
    pub analysis_ttl_secs: u64,

    /// How often stale records are swept.
    pub cleanup_interval_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            inactivity_threshold_minutes: 5,
            player_activity_radius: 4,
            structure_diversity_threshold: 12,
            max_activity_age_minutes: 120,
            diversity_stride_xz: 4,
            diversity_stride_y: 8,
            analysis_ttl_secs: 300,
            cleanup_interval_secs: 600,
        }
    }
}

impl ActivityConfig {
    pub fn inactivity_threshold(&self) -> Millis {
        self.inactivity_threshold_minutes * MILLIS_PER_MINUTE
    }

    pub fn max_activity_age(&self) -> Millis {
        self.max_activity_age_minutes * MILLIS_PER_MINUTE
    }

    pub fn analysis_ttl(&self) -> Millis {
        self.analysis_ttl_secs * MILLIS_PER_SECOND
    }
}

/// Eviction cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub enabled: bool,

    /// Seconds between eviction cycles.
    pub interval_secs: u64,

    /// Never unload a world below this many loaded cells.
    pub min_cells_per_world: usize,

    /// Maximum unloads issued per cycle.
    pub max_unloads_per_cycle: usize,

    /// Let cells near the world border skip the convergence veto.
    pub aggressive_border_eviction: bool,

    /// Distance from the border (in cells) that counts as "near".
    pub border_margin_cells: i32,

    /// Convergence veto radius, as a multiple of `player_activity_radius`.
    pub convergence_radius_multiplier: i32,

    /// A cell is vetoed when at least this many observers are within the convergence radius.
    pub convergence_observer_limit: usize,

    /// Evicted count at which a cycle summary is logged at info level (0 = never).
    pub report_threshold: u64,

    /// Also broadcast the summary through the engine.
    pub broadcast_reports: bool,

    /// Rough memory held by one loaded cell, for the reclaimed-memory estimate.
    pub estimated_cell_bytes: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            min_cells_per_world: 50,
            max_unloads_per_cycle: 20,
            aggressive_border_eviction: false,
            border_margin_cells: 2,
            convergence_radius_multiplier: 2,
            convergence_observer_limit: 2,
            report_threshold: 10,
            broadcast_reports: false,
            estimated_cell_bytes: 64 * 1024,
        }
    }
}

/// Prefetch cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub enabled: bool,

    /// Milliseconds between prefetch cycles.
    pub interval_ms: u64,

    /// Maximum loads issued per cycle, shared by all observers.
    pub max_preloads_per_cycle: usize,

    /// Neighbourhood radius (cells) considered around each observer.
    pub preload_radius: i32,

    /// Bias candidates towards the direction of travel.
    pub directional: bool,

    /// Minimum dot product between offset and heading for a candidate to count as ahead.
    pub directional_threshold: f64,

    /// Blocks per second at which an observer counts as moving.
    pub min_movement_speed: f64,

    /// Displacements shorter than this (blocks) keep the previous heading.
    pub movement_noise_floor: f64,

    /// Movement state is dropped after this long without an update.
    pub observer_idle_timeout_secs: u64,

    /// Generate cells that do not exist yet.
    pub generate_missing: bool,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
            max_preloads_per_cycle: 10,
            preload_radius: 3,
            directional: true,
            directional_threshold: 0.3,
            min_movement_speed: 1.0,
            movement_noise_floor: 0.1,
            observer_idle_timeout_secs: 60,
            generate_missing: true,
        }
    }
}

impl PrefetchConfig {
    pub fn observer_idle_timeout(&self) -> Millis {
        self.observer_idle_timeout_secs * MILLIS_PER_SECOND
    }
}

/// How cycles are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// Probe the engine once at startup.
    #[default]
    Auto,
    /// One update loop; worlds processed in order.
    GlobalLoop,
    /// Worlds processed in parallel.
    RegionParallel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub mode: SchedulerMode,
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject settings the cycles cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.activity.diversity_stride_xz == 0 {
            return Err(ConfigError::Zero { field: "diversity_stride_xz" });
        }
        if self.activity.diversity_stride_y == 0 {
            return Err(ConfigError::Zero { field: "diversity_stride_y" });
        }
        if self.activity.cleanup_interval_secs == 0 {
            return Err(ConfigError::Zero { field: "cleanup_interval_secs" });
        }
        if self.eviction.interval_secs == 0 {
            return Err(ConfigError::Zero { field: "eviction.interval_secs" });
        }
        if self.prefetch.interval_ms == 0 {
            return Err(ConfigError::Zero { field: "prefetch.interval_ms" });
        }
        if self.eviction.convergence_observer_limit == 0 {
            return Err(ConfigError::Zero { field: "convergence_observer_limit" });
        }
        for (field, value) in [
            ("player_activity_radius", self.activity.player_activity_radius),
            ("border_margin_cells", self.eviction.border_margin_cells),
            ("convergence_radius_multiplier", self.eviction.convergence_radius_multiplier),
            ("preload_radius", self.prefetch.preload_radius),
        ] {
            if value < 0 {
                return Err(ConfigError::Negative { field, value: f64::from(value) });
            }
        }
        if self.prefetch.min_movement_speed < 0.0 {
            return Err(ConfigError::Negative {
                field: "min_movement_speed",
                value: self.prefetch.min_movement_speed,
            });
        }
        if self.prefetch.movement_noise_floor <= 0.0 {
            return Err(ConfigError::Zero { field: "movement_noise_floor" });
        }
        if !(-1.0..=1.0).contains(&self.prefetch.directional_threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.prefetch.directional_threshold));
        }
        Ok(())
    }

    /// Whether the cycles should act on `world`.
    pub fn is_world_enabled(&self, world: &WorldId) -> bool {
        self.enabled_worlds.is_empty()
            || self.enabled_worlds.iter().any(|w| w == world.as_str())
    }
}
