// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! ironloop - Industrial Process-Control Engine
//!
//! Samples plant I/O on fixed schedules, runs PID or hysteresis control
//! loops, and fans results out to actuators, MQTT and SQLite, with a
//! guaranteed safe-state write on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ironloop::io::SimulatedIo;
use ironloop::{Config, Engine, VERSION};

/// ironloop - Industrial Process-Control Engine
#[derive(Parser, Debug)]
#[command(name = "ironloop")]
#[command(author = "ironloop contributors")]
#[command(version = VERSION)]
#[command(about = "Tick-driven process control with MQTT telemetry and SQLite history")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// MQTT broker address (enables the bus link)
    #[arg(long)]
    mqtt_broker: Option<String>,

    /// Database file path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Seed for the simulated I/O adapter (reproducible bench runs)
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.trace {
        Level::TRACE
    } else if args.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("ironloop v{} - Industrial Process-Control Engine", VERSION);

    let config_path = args.config.unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path);

    // Command line overrides
    if let Some(broker) = args.mqtt_broker {
        config.mqtt.enabled = true;
        config.mqtt.broker = broker;
    }
    if let Some(db_path) = args.db_path {
        config.database.path = db_path;
    }

    info!(
        "{} channels, {} control loops, {} alert rules configured",
        config.channels.len(),
        config.loops.len(),
        config.alerts.rules.len()
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config, args.seed))
}

async fn run(config: Config, seed: Option<u64>) -> Result<()> {
    // Hardware driver bindings live in adapter crates; the built-in
    // simulator stands in for them here.
    let adapter = Arc::new(match seed {
        Some(seed) => SimulatedIo::with_seed(seed),
        None => SimulatedIo::new(),
    });

    let mut engine = Engine::new(config, adapter).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            let _ = shutdown_tx.send(());
        }
    });

    info!("Press Ctrl+C to stop; outputs revert to safe values on exit");
    engine.run(shutdown_rx).await?;

    info!("ironloop shutdown complete");
    Ok(())
}
