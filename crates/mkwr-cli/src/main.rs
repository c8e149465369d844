mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use mkwr_core::{format_finish_time, CourseRegistry, EngineClass, Record};
use mkwr_storage::{RecordFilter, SnapshotId, SnapshotStore};
use mkwr_sync::{load_registry, new_records_since_previous, ScrapeConfig, ScrapePipeline};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "mkwr")]
#[command(about = "Mario Kart 8 Deluxe world record snapshots")]
struct Cli {
    /// Reference data, snapshots and scrape log [env: MKWR_DATA_DIR]
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Snapshot directory [env: MKWR_SNAPSHOT_DIR]
    #[arg(long, global = true)]
    snapshot_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every course and engine class into a new snapshot.
    Scrape {
        /// Snapshots to retain afterwards [env: MKWR_KEEP_SNAPSHOTS]
        #[arg(long)]
        keep: Option<usize>,
    },
    /// List stored snapshots, oldest first.
    Snapshots,
    /// Print records from a snapshot.
    Records {
        #[arg(long)]
        course: Option<String>,
        /// 150cc/standard or 200cc/high
        #[arg(long)]
        class: Option<EngineClass>,
        /// Earliest record date, inclusive (YYYY-MM-DD).
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Latest record date, inclusive (YYYY-MM-DD).
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Snapshot id; defaults to the latest.
        #[arg(long)]
        snapshot: Option<String>,
        /// One JSON object per line.
        #[arg(long)]
        json: bool,
    },
    /// Best times that improved between the two most recent snapshots.
    NewRecords {
        #[arg(long)]
        json: bool,
    },
    /// Delete all but the most recent snapshots.
    Prune {
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ScrapeConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(snapshot_dir) = cli.snapshot_dir {
        config.snapshot_dir = Some(snapshot_dir);
    }

    let command = cli.command.unwrap_or(Commands::Scrape { keep: None });
    let log_file = matches!(command, Commands::Scrape { .. }).then(|| config.log_path());
    logging::setup_logging(log_file.as_deref())?;

    let registry = Arc::new(load_registry(&config).context("loading course registry")?);
    let store = SnapshotStore::new(config.snapshot_dir(), registry.clone());

    match command {
        Commands::Scrape { keep } => {
            if let Some(keep) = keep {
                config.keep_snapshots = keep;
            }
            let pipeline = ScrapePipeline::new(config, registry).context("building http client")?;
            let summary = pipeline.run_once().await?;
            println!(
                "scrape complete: snapshot={} pages={} records={} pruned={}",
                summary.snapshot,
                summary.pages,
                summary.records,
                summary.pruned.len()
            );
        }
        Commands::Snapshots => {
            for id in store.list().await? {
                let taken = id
                    .timestamp()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                println!("{id}\t{taken}");
            }
        }
        Commands::Records {
            course,
            class,
            from,
            to,
            snapshot,
            json,
        } => {
            let id = match snapshot {
                Some(raw) => SnapshotId::parse(&raw).with_context(|| format!("invalid snapshot id {raw:?}"))?,
                None => store.latest().await?,
            };
            let course = course
                .map(|name| registry.id_of(&name).with_context(|| format!("unknown course {name:?}")))
                .transpose()?;
            let filter = RecordFilter {
                course,
                engine_class: class,
                min_date: from,
                max_date: to,
            };
            let records = store.read(&id, &filter).await?;
            info!(snapshot = %id, records = records.len(), "read records");
            for record in &records {
                if json {
                    println!("{}", serde_json::to_string(record)?);
                } else {
                    println!("{}", record_line(&registry, record));
                }
            }
        }
        Commands::NewRecords { json } => {
            let delta = new_records_since_previous(&store).await?;
            if !json {
                println!("new records since {} (as of {}):", delta.previous, delta.current);
            }
            for new in &delta.new_records {
                if json {
                    println!("{}", serde_json::to_string(new)?);
                } else {
                    println!(
                        "{}\t-{}",
                        record_line(&registry, &new.record),
                        format_finish_time(new.improvement_ms)
                    );
                }
            }
        }
        Commands::Prune { keep } => {
            let keep = keep.unwrap_or(config.keep_snapshots);
            let removed = store.prune(keep).await?;
            println!("pruned {} snapshot(s), kept at most {keep}", removed.len());
        }
    }

    Ok(())
}

fn record_line(registry: &CourseRegistry, record: &Record) -> String {
    let date = record
        .date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "????-??-??".to_string());
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}d",
        registry.name(record.course).unwrap_or("?"),
        record.engine_class,
        date,
        format_finish_time(record.time_ms),
        record.player,
        record.country,
        record.days
    )
}
