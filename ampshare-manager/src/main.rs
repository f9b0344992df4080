//! AmpShare Manager - grid allocation service
//!
//! Tracks grid membership and publishes each grid's fair-share charge current.
//!
//! # Usage
//!
//! ```bash
//! ampshare-manager mqtt://localhost:1883
//!
//! # Bigger grids, faster reset-round timeout
//! ampshare-manager mqtt://localhost:1883 --capacity 120 --reset-timeout-secs 2
//! ```

use std::time::Duration;

use ampshare_core::{
    manager_will, BrokerUri, BusOptions, ManagerConfig, ManagerService, MqttBus, RegistrySnapshot,
};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// AmpShare grid manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker URI (scheme://host:port)
    broker: String,

    /// Capacity in amperes of newly created grids
    #[arg(long, default_value = "60")]
    capacity: u32,

    /// Seconds a reset round may wait for acknowledgements
    #[arg(long, default_value = "5")]
    reset_timeout_secs: u64,

    /// Zero re-broadcasts before a round completes without every acknowledgement
    #[arg(long, default_value = "3")]
    max_reset_retries: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let broker: BrokerUri = match args.broker.parse() {
        Ok(uri) => uri,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

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

    println!("Starting charging manager ...");
    println!("  broker:   {}", broker);
    println!("  capacity: {} A per grid", args.capacity);
    println!();

    let config = ManagerConfig::default()
        .with_capacity(args.capacity)
        .with_reset_timeout(Duration::from_secs(args.reset_timeout_secs))
        .with_max_reset_retries(args.max_reset_retries);

    let client_id = format!("ampshare-manager-{}", &Uuid::new_v4().to_string()[..8]);
    let options = BusOptions::new(broker, client_id);
    let (bus, events) = MqttBus::connect(&options, Some(manager_will()?));

    let service = ManagerService::new(bus, events, config);
    tokio::spawn(render(service.snapshots()));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    service.run(shutdown).await?;

    // Let the offline notice and disconnect reach the broker
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("Manager stopped");
    Ok(())
}

/// Print the grid table whenever it changes
async fn render(mut snapshots: watch::Receiver<RegistrySnapshot>) {
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();

        println!("── grids @ {} ──", snapshot.taken_at.format("%H:%M:%S"));
        if snapshot.grids.is_empty() {
            println!("  (none)");
        }
        for grid in &snapshot.grids {
            let stations: Vec<String> = grid
                .stations
                .iter()
                .map(|s| {
                    if s.ready {
                        s.station_id.clone()
                    } else {
                        format!("{}*", s.station_id)
                    }
                })
                .collect();
            println!(
                "  {:<16} {:>4} A / {:>4} A{}  [{}]",
                grid.grid_id,
                grid.current_allocation,
                grid.capacity,
                if grid.resetting { " (reset)" } else { "" },
                stations.join(", ")
            );
        }
    }
}
