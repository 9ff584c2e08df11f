//! CLI entry point for the fare KPI aggregator.
//!
//! Provides subcommands for driving change-record batch files through the
//! aggregation engine, backfilling from a full table snapshot, and
//! republishing KPI snapshots.

use anyhow::{Result, bail};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use fare_kpi::backfill::{scan_table, store_scan};
use fare_kpi::decoder::RawRecord;
use fare_kpi::driver::{BatchDriver, DriverConfig, DriverError, DriverReport, LogAlertSink};
use fare_kpi::engine::{AggregationEngine, EngineConfig};
use fare_kpi::publish::{LocalDirSink, S3Sink, SnapshotPublisher, SnapshotSink};
use fare_kpi::retry::RetryPolicy;
use fare_kpi::source::{list_batch_files, load_records, load_table_rows, split_batches};
use fare_kpi::store::{FileRollupStore, RollupStore, bounded};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "fare_kpi")]
#[command(about = "Daily fare KPIs from trip change records", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Settings {
    /// Directory holding rollups and batch commit records
    #[arg(long, env = "FARE_KPI_STATE_DIR", default_value = "state", global = true)]
    state_dir: PathBuf,

    /// S3 bucket to publish snapshots to (e.g., "my-bucket")
    #[arg(long, env = "FARE_KPI_S3_BUCKET", global = true)]
    s3_bucket: Option<String>,

    /// Key prefix for published snapshots
    #[arg(long, env = "FARE_KPI_SNAPSHOT_PREFIX", default_value = "", global = true)]
    snapshot_prefix: String,

    /// Local directory to publish snapshots to when no bucket is given
    #[arg(long, env = "FARE_KPI_SNAPSHOT_DIR", default_value = "snapshots", global = true)]
    snapshot_dir: PathBuf,

    /// Maximum records per batch
    #[arg(long, env = "FARE_KPI_BATCH_SIZE", default_value_t = 100, global = true)]
    batch_size: usize,

    /// Attempts per batch (and per snapshot publish), including the first
    #[arg(long, env = "FARE_KPI_MAX_ATTEMPTS", default_value_t = 5, global = true)]
    max_attempts: u32,

    /// Backoff before the first retry, in milliseconds
    #[arg(long, env = "FARE_KPI_INITIAL_BACKOFF_MS", default_value_t = 1000, global = true)]
    initial_backoff_ms: u64,

    /// Multiplier applied to the backoff after every failed attempt
    #[arg(long, env = "FARE_KPI_BACKOFF_COEFFICIENT", default_value_t = 2, global = true)]
    backoff_coefficient: u32,

    /// Upper bound on a single backoff, in milliseconds
    #[arg(long, env = "FARE_KPI_MAX_BACKOFF_MS", default_value_t = 30_000, global = true)]
    max_backoff_ms: u64,

    /// Timeout for every store and snapshot sink call, in milliseconds
    #[arg(long, env = "FARE_KPI_TIMEOUT_MS", default_value_t = 5_000, global = true)]
    timeout_ms: u64,

    /// Conditional write attempts per date before a batch is retried
    #[arg(long, env = "FARE_KPI_CAS_RETRIES", default_value_t = 32, global = true)]
    cas_retries: u32,

    /// Time budget per batch in seconds (0 = unbounded)
    #[arg(long, env = "FARE_KPI_DEADLINE_SECS", default_value_t = 0, global = true)]
    deadline_secs: u64,

    /// Maximum number of partitions driven concurrently
    #[arg(short, long, env = "FARE_KPI_CONCURRENCY", default_value_t = 4, global = true)]
    concurrency: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive one batch file of change records
    Process {
        /// JSON array or JSON lines file, optionally gzip-compressed
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Drive every batch file in a directory, in file name order
    Consume {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    /// Aggregate a full trip table snapshot and publish every date in it
    Backfill {
        /// CSV or JSON lines table, optionally gzip-compressed
        #[arg(value_name = "TABLE")]
        table: PathBuf,

        /// Only update the store; leave snapshots untouched
        #[arg(long, default_value_t = false)]
        no_publish: bool,
    },
    /// Republish snapshots from stored rollups
    Publish {
        /// Only this date (YYYY-MM-DD); every stored date when omitted
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

impl Settings {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.backoff_coefficient,
            Duration::from_millis(self.initial_backoff_ms),
            Some(Duration::from_millis(self.max_backoff_ms)),
        )
    }

    async fn sink(&self) -> Result<Arc<dyn SnapshotSink>> {
        let sink: Arc<dyn SnapshotSink> = match &self.s3_bucket {
            Some(bucket) if !bucket.is_empty() => {
                info!(bucket = %bucket, prefix = %self.snapshot_prefix, "Publishing snapshots to S3");
                Arc::new(S3Sink::from_env(bucket.clone()).await)
            }
            _ => {
                std::fs::create_dir_all(&self.snapshot_dir)?;
                info!(dir = %self.snapshot_dir.display(), "Publishing snapshots to local directory");
                Arc::new(LocalDirSink::new(self.snapshot_dir.clone()))
            }
        };
        Ok(sink)
    }
}

/// Store, publisher and driver wired from the settings.
struct Pipeline {
    store: Arc<dyn RollupStore>,
    publisher: Arc<SnapshotPublisher>,
    driver: Arc<BatchDriver>,
}

impl Pipeline {
    async fn build(settings: &Settings) -> Result<Self> {
        let store: Arc<dyn RollupStore> =
            Arc::new(FileRollupStore::open(&settings.state_dir).await?);
        let publisher = Arc::new(SnapshotPublisher::new(
            store.clone(),
            settings.sink().await?,
            settings.snapshot_prefix.clone(),
            settings.timeout(),
        ));
        let engine = Arc::new(AggregationEngine::new(
            store.clone(),
            EngineConfig {
                store_timeout: settings.timeout(),
                max_cas_attempts: settings.cas_retries.max(1),
            },
        ));
        let config = DriverConfig {
            aggregate_retry: settings.retry_policy(),
            publish_retry: settings.retry_policy(),
            store_timeout: settings.timeout(),
            batch_deadline: (settings.deadline_secs > 0)
                .then(|| Duration::from_secs(settings.deadline_secs)),
        };
        let driver = Arc::new(BatchDriver::new(
            engine,
            publisher.clone(),
            Arc::new(LogAlertSink),
            config,
        ));
        Ok(Self {
            store,
            publisher,
            driver,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/fare_kpi.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("fare_kpi.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let settings = cli.settings;
    let pipeline = Pipeline::build(&settings).await?;

    match cli.command {
        Commands::Process { file } => {
            let records = load_records(&file)?;
            drive_records(&pipeline, &settings, records).await?;
        }
        Commands::Consume { dir } => {
            let files = list_batch_files(&dir)?;
            info!(dir = %dir.display(), files = files.len(), "Consuming batch files");
            let mut records = Vec::new();
            for file in &files {
                records.extend(load_records(file)?);
            }
            drive_records(&pipeline, &settings, records).await?;
        }
        Commands::Backfill { table, no_publish } => {
            let rows = load_table_rows(&table)?;
            let scan = scan_table(rows);
            let dates = store_scan(
                pipeline.store.as_ref(),
                &scan,
                settings.timeout(),
                settings.cas_retries.max(1),
            )
            .await?;
            if no_publish {
                info!(dates = dates.len(), "Backfill stored, skipping publication");
            } else {
                publish_dates(&pipeline, dates).await?;
            }
        }
        Commands::Publish { date } => {
            let dates = match date {
                Some(date) => vec![date],
                None => bounded(settings.timeout(), pipeline.store.dates()).await?,
            };
            publish_dates(&pipeline, dates).await?;
        }
    }

    Ok(())
}

/// Splits records into per-partition batches and drives them, one worker per
/// partition.
#[tracing::instrument(skip_all, fields(records = records.len()))]
async fn drive_records(
    pipeline: &Pipeline,
    settings: &Settings,
    records: Vec<RawRecord>,
) -> Result<()> {
    let partitions = split_batches(records, settings.batch_size);
    info!(
        partitions = partitions.len(),
        concurrency = settings.concurrency,
        "Driving batches"
    );

    let results = pipeline
        .driver
        .clone()
        .drive_all(partitions, settings.concurrency)
        .await;
    summarize(results)
}

fn summarize(results: BTreeMap<String, Result<Vec<DriverReport>, DriverError>>) -> Result<()> {
    let mut failed = 0;
    for (partition, result) in results {
        match result {
            Ok(reports) => {
                let applied: usize = reports
                    .iter()
                    .filter_map(|r| r.outcome.as_ref())
                    .map(|o| o.applied)
                    .sum();
                let published: usize = reports.iter().map(|r| r.published.len()).sum();
                info!(
                    partition = %partition,
                    batches = reports.len(),
                    applied,
                    published,
                    "Partition drained"
                );
            }
            Err(e) => {
                failed += 1;
                error!(partition = %partition, error = %e, "Partition stopped");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} partition(s) stopped on a failed batch");
    }
    Ok(())
}

async fn publish_dates(pipeline: &Pipeline, dates: Vec<NaiveDate>) -> Result<()> {
    if dates.is_empty() {
        warn!("No dates to publish");
    }
    for date in dates {
        pipeline.publisher.publish(date).await?;
    }
    Ok(())
}
