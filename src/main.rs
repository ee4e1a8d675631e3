// src/main.rs

//! The main entry point for the GarnetFS node daemon.

use anyhow::{Context, Result};
use garnetfs::config::Config;
use garnetfs::node::{NodeState, spawner};
use std::env;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("GarnetFS version {VERSION}");
        return Ok(());
    }

    // Set up logging with a reloadable filter so the level can be retargeted
    // at runtime.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, _reload_handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    info!("Starting GarnetFS node version {VERSION}");

    // An explicit config path is optional; the defaults run a standalone node.
    let config = match args.get(1) {
        Some(path) => {
            Config::from_file(path).with_context(|| format!("loading config '{path}'"))?
        }
        None => {
            info!("No config file given, using built-in defaults.");
            Config::default()
        }
    };

    // Startup failures here are fatal by design: an underivable cipher key or
    // an unusable audit directory must not be papered over.
    let init = match NodeState::initialize(config) {
        Ok(init) => init,
        Err(e) => {
            error!("Fatal initialization error: {e}");
            std::process::exit(1);
        }
    };

    let (state, handles) = spawner::spawn_background_tasks(init);

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;

    info!("Shutdown signal received.");
    state.shutdown();

    for handle in handles {
        let _ = handle.await;
    }

    info!("GarnetFS node stopped.");
    Ok(())
}
