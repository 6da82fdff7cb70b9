//! parkwatchd - parking occupancy daemon
//!
//! This daemon:
//! 1. Loads configuration (PARKWATCH_CONFIG file + environment overrides)
//! 2. Opens every configured source and its spot file
//! 3. Runs the pipeline supervisor on a background thread
//! 4. Serves the occupancy API and live MJPEG streams
//! 5. Stops both on Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use parkwatch::{
    api::{ApiConfig, ApiServer},
    config::ParkwatchConfig,
    JsonSpotStore, Supervisor,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ParkwatchConfig::load()?;
    let mut spots = JsonSpotStore::new();
    for source in &config.sources {
        spots.insert(source.id.clone(), source.spots.clone());
    }

    let mut supervisor = Supervisor::from_config(&config, &spots);
    let registry = supervisor.registry();
    let distributors = supervisor.distributors();

    let api_handle =
        ApiServer::new(ApiConfig::from(&config.api), registry, distributors).spawn()?;
    log::info!("parking api listening on {}", api_handle.addr);

    let shutdown = Arc::new(AtomicBool::new(false));
    let supervisor_shutdown = shutdown.clone();
    let supervisor_thread = std::thread::spawn(move || supervisor.run(&supervisor_shutdown));

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!(
        "parkwatchd running {} source(s); waiting for shutdown signal (Ctrl-C)...",
        config.sources.len()
    );
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping supervisor and API server...");
    shutdown.store(true, Ordering::SeqCst);
    supervisor_thread
        .join()
        .map_err(|_| anyhow!("supervisor thread panicked"))?;
    api_handle.stop()?;

    Ok(())
}
