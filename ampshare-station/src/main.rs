//! AmpShare Station - simulated charging station
//!
//! Joins a grid, charges at whatever current the manager allots and takes part
//! in reset rounds.
//!
//! # Usage
//!
//! ```bash
//! ampshare-station mqtt://localhost:1883 garage-north bay-1
//! ampshare-station mqtt://localhost:1883 garage-north bay-2
//! ```

use std::time::Duration;

use ampshare_core::{
    station_will, BrokerUri, BusOptions, MqttBus, StationConfig, StationService, StationSnapshot,
};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// AmpShare charging station
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker URI (scheme://host:port)
    broker: String,

    /// Grid to join
    grid: String,

    /// Station identifier, unique within the grid
    station: String,

    /// Charge simulation step in milliseconds
    #[arg(long, default_value = "1000")]
    tick_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let broker: BrokerUri = args.broker.parse().unwrap_or_else(|e| exit_config_error(e));
    let config = StationConfig::new(&args.grid, &args.station)
        .unwrap_or_else(|e| exit_config_error(e))
        .with_tick(Duration::from_millis(args.tick_ms.max(1)));

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!("Starting station with following settings:");
    println!("  broker: {}, grid: {}, station: {}", broker, config.grid_id, config.station_id);
    println!();

    let client_id = format!(
        "ampshare-{}-{}-{}",
        config.grid_id,
        config.station_id,
        &Uuid::new_v4().to_string()[..8]
    );
    let options = BusOptions::new(broker, client_id);
    let (bus, events) = MqttBus::connect(&options, Some(station_will(&config)?));

    let service = StationService::new(bus, events, config);
    tokio::spawn(render(service.snapshots()));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    service.run(shutdown).await?;

    // Let the leave and disconnect reach the broker
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("Station stopped");
    Ok(())
}

fn exit_config_error(e: ampshare_core::ConfigError) -> ! {
    eprintln!("{}", e);
    std::process::exit(1);
}

/// One status line per change of phase, rate or whole percent
async fn render(mut snapshots: watch::Receiver<StationSnapshot>) {
    let mut last: Option<(String, u32, u32)> = None;

    while snapshots.changed().await.is_ok() {
        let s = snapshots.borrow_and_update().clone();
        let key = (s.phase.to_string(), s.charge_rate, s.charge_percent as u32);
        if last.as_ref() == Some(&key) {
            continue;
        }

        println!(
            "[{}] {:<12} {:>3} A  {:>5.1}% {}",
            s.updated_at.format("%H:%M:%S"),
            s.phase,
            s.charge_rate,
            s.charge_percent,
            bar(s.charge_percent)
        );
        last = Some(key);
    }
}

fn bar(percent: f64) -> String {
    let filled = ((percent / 5.0) as usize).min(20);
    format!("[{}{}]", "#".repeat(filled), ".".repeat(20 - filled))
}
