//! Command-line interface for the BLE tracker.

use anyhow::{Context, Result};
use ble_tracker::domain::attributes::AttributeWeightTable;
use ble_tracker::domain::correlation::{CorrelationEngine, SearchOptions, MOST_SEEN_SPAN_HOURS};
use ble_tracker::domain::models::{GattOutcome, PipelineEvent};
use ble_tracker::domain::reference::ReferenceData;
use ble_tracker::domain::settings::SettingsService;
use ble_tracker::domain::similarity::AttributeValue;
use ble_tracker::domain::store::ObservationStore;
use ble_tracker::infrastructure::bluetooth::btleplug_backend::BtleplugAdapter;
use ble_tracker::infrastructure::bluetooth::TrackerService;
use ble_tracker::infrastructure::logging::init_logger;
use ble_tracker::infrastructure::store::Database;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Passive Bluetooth device tracker.
#[derive(Parser, Debug)]
#[command(name = "ble_tracker")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Settings file (defaults to the user config directory).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding the settings.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan, enumerate and store until Ctrl-C.
    Scan {
        /// Stop after this many seconds.
        #[arg(long)]
        duration: Option<u64>,
        /// Skip GATT enumeration.
        #[arg(long)]
        no_gatt: bool,
    },
    /// Rank stored devices by similarity to a device's address group.
    Similar {
        id: i64,
        /// Minimum score, overriding the settings.
        #[arg(short, long)]
        threshold: Option<f64>,
        /// Maximum number of matches printed.
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Attribute-by-attribute comparison of two devices.
    Compare { left: i64, right: i64 },
    /// Show one device with its GATT tree and sightings.
    Device { id: i64 },
    /// Addresses seen over a long period.
    MostSeen {
        #[arg(long, default_value_t = MOST_SEEN_SPAN_HOURS)]
        hours: i64,
    },
    /// Devices whose name contains a fragment.
    Search { fragment: String },
    /// Set the geolocation of sightings between two RFC 3339 timestamps.
    Geotag {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        place: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings_service = match &args.config {
        Some(path) => SettingsService::from_path(path.clone()),
        None => SettingsService::new()?,
    };
    if args.verbose {
        settings_service.get_mut().log_settings.level = "debug".to_string();
    }
    if let Some(db) = &args.db {
        settings_service.get_mut().store.database_path = Some(db.clone());
    }
    let _guard = init_logger(&settings_service.get().log_settings)?;
    info!("Starting ble_tracker");

    let settings = settings_service.get().clone();
    let database_path = settings_service.database_path();
    let store = Arc::new(
        Database::new(database_path.clone())
            .with_context(|| format!("failed to open database {}", database_path.display()))?,
    );

    match args.command {
        Command::Scan { duration, no_gatt } => {
            let reference = Arc::new(
                ReferenceData::load(&settings.reference).context("failed to load reference data")?,
            );
            let adapter = Arc::new(BtleplugAdapter::first_available().await?);
            let mut settings = settings;
            if no_gatt {
                settings.gatt.enabled = false;
            }

            let service = TrackerService::new(adapter, store, reference, &settings);
            let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
            let pipeline = service.start(Some(observer_tx));

            let deadline = async {
                match duration {
                    Some(secs) => tokio::time::sleep(std::time::Duration::from_secs(secs)).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = &mut deadline => break,
                    event = observer_rx.recv() => match event {
                        Some(event) => print_event(&event),
                        None => break,
                    },
                }
            }

            let stats = pipeline.stop().await;
            println!(
                "{} observations, {} GATT trees stored, {} sessions abandoned",
                stats.observations_stored, stats.gatt_trees_stored, stats.gatt_abandoned
            );
        }
        Command::Similar {
            id,
            threshold,
            limit,
        } => {
            let engine = CorrelationEngine::new(store, AttributeWeightTable::standard());
            let mut options = SearchOptions::from(&settings.correlation);
            if let Some(threshold) = threshold {
                options.threshold = threshold;
            }
            let matches = engine.find_similar_devices(id, options).await?;
            for m in matches.iter().take(limit) {
                println!("{:>8}  {:.4}", m.device_id, m.score);
            }
        }
        Command::Compare { left, right } => {
            let engine = CorrelationEngine::new(store, AttributeWeightTable::standard());
            let comparison = engine.compare_devices(left, right).await?;
            println!("{:<20} {:>6} {:>7}  {} | {}", "attribute", "weight", "score", left, right);
            for row in &comparison.attributes {
                let show = |v: &Option<AttributeValue>| {
                    v.as_ref()
                        .map(AttributeValue::display)
                        .unwrap_or_else(|| "-".to_string())
                };
                let score = row
                    .similarity
                    .map(|s| format!("{s:.3}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<20} {:>6.1} {:>7}  {} | {}",
                    row.name,
                    row.weight,
                    score,
                    show(&row.left),
                    show(&row.right)
                );
            }
            println!("overall: {:.4}", comparison.score);
        }
        Command::Device { id } => {
            let engine = CorrelationEngine::new(store, AttributeWeightTable::standard());
            let report = engine.get_device(id).await?;
            println!("{}", serde_json::to_string_pretty(&report.device.attributes)?);
            if let Some(tree) = &report.device.gatt {
                println!("{}", serde_json::to_string_pretty(tree.as_ref())?);
            }
            for sighting in &report.sightings {
                println!(
                    "seen {} {}",
                    sighting.timestamp.to_rfc3339(),
                    sighting.geolocation.as_deref().unwrap_or("")
                );
            }
        }
        Command::MostSeen { hours } => {
            let engine = CorrelationEngine::new(store, AttributeWeightTable::standard());
            let seen = engine
                .most_seen_devices(chrono::Duration::hours(hours))
                .await?;
            for entry in seen {
                println!(
                    "{}  {} sightings  {} -> {}",
                    entry.address,
                    entry.sightings,
                    entry.first_seen.to_rfc3339(),
                    entry.last_seen.to_rfc3339()
                );
            }
        }
        Command::Search { fragment } => {
            let engine = CorrelationEngine::new(store, AttributeWeightTable::standard());
            for id in engine.search_devices(&fragment).await? {
                println!("{id}");
            }
        }
        Command::Geotag { from, to, place } => {
            let updated = store.set_geolocation(from, to, &place).await?;
            println!("{updated} sightings updated");
        }
    }

    Ok(())
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::DeviceObserved(observation) => {
            let attributes = &observation.attributes;
            println!(
                "{}  {:<24} {:<16} rssi={}",
                attributes.address,
                attributes.name.as_deref().unwrap_or("-"),
                attributes.device_type.as_deref().unwrap_or("-"),
                observation
                    .rssi
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        PipelineEvent::GattResolved(resolution) => match resolution.outcome {
            GattOutcome::Done => println!(
                "{}  GATT: {} services, {} characteristics",
                resolution.address,
                resolution.tree.services.len(),
                resolution.tree.characteristics.len()
            ),
            GattOutcome::Abandoned => println!(
                "{}  GATT abandoned after {} attempts",
                resolution.address, resolution.attempts
            ),
        },
    }
}
