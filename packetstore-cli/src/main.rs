/*!
packetstore CLI - operator tool for the packet record store.

Inspects and loads the configured backend, takes one-off snapshots, and runs
the periodic backup scheduler in the foreground.
*/

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use packetstore_core::config::{DEFAULT_CONFIG_PATH, MIN_BACKUP_INTERVAL_SECS};
use packetstore_core::{
    init_observability, open_store, AppConfig, BackupScheduler, CloudPacket, PacketStore,
    StoreMetrics,
};
use tabled::{Table, Tabled};
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(name = "packetstore")]
#[command(about = "CLI for the packetstore record store")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Path to the JSON configuration file
    #[arg(short, long, global = true, env = "PACKETSTORE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List all stored packets
    List {
        /// Print the raw JSON document instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Replace the stored set with the packets in a JSON array file
    Import {
        /// File holding a JSON array of packets
        file: PathBuf,
    },
    /// Store one packet under the next free id
    Add {
        /// File holding a single JSON packet
        file: PathBuf,
    },
    /// Export the stored set to a snapshot file and empty the store
    Snapshot {
        /// Directory for the snapshot file, overriding the configuration
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Run the backup scheduler until interrupted
    Run {
        /// Seconds between snapshots, overriding the configuration
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(MIN_BACKUP_INTERVAL_SECS..))]
        interval: Option<u64>,
    },
}

#[derive(Tabled)]
struct PacketRow {
    #[tabled(rename = "ID")]
    id: i32,
    #[tabled(rename = "Region")]
    region: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Channel")]
    channel: String,
    #[tabled(rename = "Uploader")]
    uploader: String,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "User Packets")]
    user_packets: usize,
    #[tabled(rename = "Content")]
    content: String,
}

impl From<&CloudPacket> for PacketRow {
    fn from(packet: &CloudPacket) -> Self {
        Self {
            id: packet.id,
            region: packet.region.clone(),
            name: packet.name.clone(),
            channel: packet.channel.clone(),
            uploader: packet.uploader.clone(),
            time: packet.time.clone(),
            user_packets: packet.user_packets.len(),
            content: format_size(packet.content_len()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_observability(cli.verbose, cli.json_logs)?;

    let config = AppConfig::load_or_default(&cli.config);
    config.validate()?;
    let store = open_store(&config).await?;

    match cli.command {
        Commands::List { json } => list_packets(store.as_ref(), json).await?,
        Commands::Import { file } => import_packets(store.as_ref(), &file).await?,
        Commands::Add { file } => add_packet(store.as_ref(), &file).await?,
        Commands::Snapshot { dir } => {
            let mut scheduler = BackupScheduler::new(store, &config.backup);
            if let Some(dir) = dir {
                scheduler = scheduler.with_snapshot_dir(dir);
            }
            let report = scheduler.run_tick(chrono::Local::now()).await?;
            println!(
                "✓ Saved {} packets to {}",
                report.packets,
                report.path.display()
            );
        }
        Commands::Run { interval } => {
            let mut scheduler = BackupScheduler::new(store, &config.backup);
            if let Some(secs) = interval {
                scheduler = scheduler.with_interval(std::time::Duration::from_secs(secs));
            }
            run_scheduler(scheduler).await?;
        }
    }

    Ok(())
}

async fn list_packets(store: &dyn PacketStore, json: bool) -> Result<(), anyhow::Error> {
    info!(backend = store.name(), "Listing packets");
    let packets = store.load().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&packets)?);
    } else if packets.is_empty() {
        println!("No packets stored");
    } else {
        let rows: Vec<PacketRow> = packets.iter().map(PacketRow::from).collect();
        println!("{}", Table::new(rows));
    }

    Ok(())
}

async fn import_packets(store: &dyn PacketStore, file: &Path) -> Result<(), anyhow::Error> {
    let packets: Vec<CloudPacket> = read_json(file)?;
    let count = packets.len();

    store.save(&packets).await?;
    println!("✓ Imported {count} packets into {}", store.name());
    Ok(())
}

async fn add_packet(store: &dyn PacketStore, file: &Path) -> Result<(), anyhow::Error> {
    let packet: CloudPacket = read_json(file)?;

    let stored = store.create(packet).await?;
    println!(
        "✓ Stored packet {} with {} user packets",
        stored.id,
        stored.user_packets.len()
    );
    Ok(())
}

async fn run_scheduler(scheduler: BackupScheduler) -> Result<(), anyhow::Error> {
    println!(
        "Snapshotting every {}s into {} (Ctrl-C to stop)",
        scheduler.interval().as_secs(),
        scheduler.snapshot_dir().display()
    );

    let handle = scheduler.spawn();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("Interrupt received, stopping scheduler");
    handle.shutdown().await;

    debug!(metrics = %StoreMetrics::global().gather_metrics()?, "Final metrics");
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(file: &Path) -> Result<T, anyhow::Error> {
    let bytes =
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", file.display()))
}

fn format_size(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
