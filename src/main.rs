//! cell-steward demo server.
//!
//! Runs the cell manager against an in-memory world with a few simulated
//! observers walking circles, and exposes the admin API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use cell_steward::cell::coord::{ObserverId, Position, WorldId};
use cell_steward::cell::manager::CellManager;
use cell_steward::config::{Cli, Config};
use cell_steward::engine::clock::{Clock, SystemClock};
use cell_steward::engine::sim::SimulatedEngine;
use cell_steward::engine::WorldBorder;
use cell_steward::server::admin_api::{build_router, AppState};

/// Cells loaded around spawn before the first cycle.
const SPAWN_RADIUS: i32 = 8;
/// How often simulated observers report their position.
const DEMO_STEP: Duration = Duration::from_millis(250);
/// Walking speed of simulated observers, blocks per second.
const DEMO_SPEED: f64 = 5.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "cell_steward=debug,tower_http=debug"
    } else {
        "cell_steward=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("cell-steward v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        inactivity_minutes = config.activity.inactivity_threshold_minutes,
        activity_radius = config.activity.player_activity_radius,
        min_cells = config.eviction.min_cells_per_world,
        max_unloads = config.eviction.max_unloads_per_cycle,
        max_preloads = config.prefetch.max_preloads_per_cycle,
        preload_radius = config.prefetch.preload_radius,
        "Configuration loaded"
    );

    // Build the demo world.
    let world = WorldId::new("world");
    let engine = Arc::new(SimulatedEngine::new());
    engine.add_world(&world);
    engine.set_border(
        &world,
        WorldBorder {
            center_x: 0.0,
            center_z: 0.0,
            radius: 4_096.0,
        },
    );
    engine.preload_square(&world, 0, 0, SPAWN_RADIUS);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let manager = Arc::new(CellManager::new(config.clone(), engine.clone(), clock.clone())?);

    let walkers = spawn_demo_observers(engine, manager.clone(), clock, world, cli.demo_observers);
    let service = manager.start();

    // Build the HTTP router.
    let state = Arc::new(AppState {
        manager: manager.clone(),
        start_time: Instant::now(),
    });
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    walkers.abort();
    service.shutdown().await;

    let stats = manager.get_statistics();
    info!(
        cycles = stats.cycles_run,
        evicted = stats.cells_evicted,
        preloaded = stats.cells_preloaded,
        skipped = stats.cells_skipped,
        "Shut down"
    );
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }
}

/// Walk `count` observers around concentric circles centred on spawn.
fn spawn_demo_observers(
    engine: Arc<SimulatedEngine>,
    manager: Arc<CellManager>,
    clock: Arc<dyn Clock>,
    world: WorldId,
    count: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let walkers: Vec<(ObserverId, f64)> = (0..count)
            .map(|i| (ObserverId::new_random(), 96.0 + 64.0 * i as f64))
            .collect();
        let mut walked = 0.0_f64;
        let mut ticker = tokio::time::interval(DEMO_STEP);

        loop {
            ticker.tick().await;
            let now = clock.now_millis();
            for (i, &(id, radius)) in walkers.iter().enumerate() {
                // Alternate walking direction per observer.
                let theta = if i % 2 == 0 { walked / radius } else { -walked / radius };
                let position = Position::new(radius * theta.cos(), 64.0, radius * theta.sin());
                engine.set_observer(id, &world, position);
                manager.record_presence(id, &world, position, now);
            }
            walked += DEMO_SPEED * DEMO_STEP.as_secs_f64();
        }
    })
}
