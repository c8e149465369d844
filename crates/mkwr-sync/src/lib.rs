//! Scrape orchestration: every course and engine class, paced, all or nothing.

mod delta;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mkwr_adapters::{extract_page, ExtractionError};
use mkwr_core::{Course, CourseRegistry, EngineClass, Record, RegistryError, COURSES_FILE, CUPS_FILE};
use mkwr_storage::{
    FetchError, HttpClientConfig, HttpFetcher, PageSource, RetryPolicy, SnapshotError, SnapshotId,
    SnapshotStore, DEFAULT_BASE_URL, DEFAULT_KEEP_SNAPSHOTS,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

pub use delta::{best_times, compute_new_records, new_records_since_previous, NewRecord, SnapshotDelta};

pub const DEFAULT_USER_AGENT: &str = "mkwr-bot/0.1";
pub const LOG_FILE: &str = "scrape.log";

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub base_url: String,
    /// Holds the reference JSON, the snapshot directory and the scrape log.
    pub data_dir: PathBuf,
    /// Overrides `<data_dir>/snapshots`.
    pub snapshot_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Minimum wall-clock time per course/engine-class cycle.
    pub scrape_interval: Duration,
    pub retry: RetryPolicy,
    pub keep_snapshots: usize,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            data_dir: PathBuf::from("./data"),
            snapshot_dir: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 20,
            scrape_interval: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            keep_snapshots: DEFAULT_KEEP_SNAPSHOTS,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("MKWR_BASE_URL").unwrap_or(defaults.base_url),
            data_dir: std::env::var("MKWR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            snapshot_dir: std::env::var("MKWR_SNAPSHOT_DIR").ok().map(PathBuf::from),
            user_agent: std::env::var("MKWR_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("MKWR_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            scrape_interval: Duration::from_secs(env_or(
                "MKWR_SCRAPE_INTERVAL_SECS",
                defaults.scrape_interval.as_secs(),
            )),
            retry: RetryPolicy {
                max_attempts: env_or("MKWR_MAX_ATTEMPTS", defaults.retry.max_attempts),
                delay: Duration::from_millis(env_or(
                    "MKWR_RETRY_DELAY_MS",
                    defaults.retry.delay.as_millis() as u64,
                )),
            },
            keep_snapshots: env_or("MKWR_KEEP_SNAPSHOTS", defaults.keep_snapshots),
        }
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("snapshots"))
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE)
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: self.retry,
        }
    }
}

/// Loads the course registry from `data_dir` when its reference files are
/// present, otherwise from the compiled-in copies. Either way the content
/// hashes are verified.
pub fn load_registry(config: &ScrapeConfig) -> Result<CourseRegistry, RegistryError> {
    let dir = &config.data_dir;
    if dir.join(COURSES_FILE).is_file() && dir.join(CUPS_FILE).is_file() {
        CourseRegistry::load_from_dir(dir)
    } else {
        CourseRegistry::embedded()
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("fetching {course} {class}: {source}")]
    Fetch {
        course: String,
        class: EngineClass,
        #[source]
        source: FetchError,
    },
    #[error("extracting {course} {class}: {source}")]
    Extract {
        course: String,
        class: EngineClass,
        #[source]
        source: ExtractionError,
    },
    #[error(transparent)]
    Store(#[from] SnapshotError),
}

#[derive(Debug, Clone)]
pub struct ScrapeSummary {
    pub snapshot: SnapshotId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: usize,
    pub records: usize,
    pub pruned: Vec<SnapshotId>,
}

pub struct ScrapePipeline {
    config: ScrapeConfig,
    registry: Arc<CourseRegistry>,
    source: Box<dyn PageSource>,
    store: SnapshotStore,
}

impl ScrapePipeline {
    pub fn new(config: ScrapeConfig, registry: Arc<CourseRegistry>) -> Result<Self, FetchError> {
        let http = HttpFetcher::new(&config.base_url, config.http_client_config())?;
        let store = SnapshotStore::new(config.snapshot_dir(), registry.clone());
        Ok(Self {
            config,
            registry,
            source: Box::new(http),
            store,
        })
    }

    pub fn with_source(mut self, source: Box<dyn PageSource>) -> Self {
        self.source = source;
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn registry(&self) -> &CourseRegistry {
        &self.registry
    }

    /// Scrapes every course in registry order (150cc then 200cc), writes one
    /// snapshot of the whole batch and prunes old snapshots. Any failed page
    /// ends the run before anything is written. A failed prune is only
    /// logged; the written snapshot is still reported.
    pub async fn run_once(&self) -> Result<ScrapeSummary, ScrapeError> {
        let started_at = Utc::now();
        let (batch, pages) = self.scrape_all().await?;

        let snapshot = self.store.write(&batch).await.map_err(|err| {
            error!(error = %err, records = batch.len(), "failed to write snapshot");
            err
        })?;
        let pruned = match self.store.prune(self.config.keep_snapshots).await {
            Ok(pruned) => pruned,
            Err(err) => {
                warn!(snapshot = %snapshot, error = %err, "snapshot written but pruning failed");
                Vec::new()
            }
        };

        let finished_at = Utc::now();
        info!(
            snapshot = %snapshot,
            pages,
            records = batch.len(),
            pruned = pruned.len(),
            elapsed_secs = (finished_at - started_at).num_seconds(),
            "scrape complete"
        );
        Ok(ScrapeSummary {
            snapshot,
            started_at,
            finished_at,
            pages,
            records: batch.len(),
            pruned,
        })
    }

    /// Fetches and extracts every page, padding each cycle to
    /// `scrape_interval`. Returns the batch and the number of pages.
    async fn scrape_all(&self) -> Result<(Vec<Record>, usize), ScrapeError> {
        let mut batch: Vec<Record> = Vec::new();
        let mut pages = 0usize;

        for course in self.registry.iter() {
            for class in EngineClass::ALL {
                let cycle = Instant::now();
                let span = info_span!("scrape_cycle", course = course.name, class = %class);
                match self.scrape_page(&course, class).instrument(span).await {
                    Ok(records) => batch.extend(records),
                    Err(err) => {
                        error!(
                            course = course.name,
                            class = %class,
                            error = %err,
                            "failed to scrape {} {}; terminating without a snapshot",
                            course.name,
                            class
                        );
                        return Err(err);
                    }
                }
                pages += 1;

                let remaining = self.config.scrape_interval.saturating_sub(cycle.elapsed());
                if !remaining.is_zero() {
                    tokio::time::sleep(remaining).await;
                }
            }
        }
        Ok((batch, pages))
    }

    async fn scrape_page(&self, course: &Course<'_>, class: EngineClass) -> Result<Vec<Record>, ScrapeError> {
        let page = self
            .source
            .fetch_page(course.name, class)
            .await
            .map_err(|source| ScrapeError::Fetch {
                course: course.name.to_string(),
                class,
                source,
            })?;
        let records = extract_page(&page.body, course, class).map_err(|source| ScrapeError::Extract {
            course: course.name.to_string(),
            class,
            source,
        })?;
        info!(records = records.len(), "scraped {} {}", course.name, class);
        Ok(records)
    }
}

pub async fn run_scrape_once_from_env() -> Result<ScrapeSummary> {
    let config = ScrapeConfig::from_env();
    let registry = load_registry(&config).context("loading course registry")?;
    let pipeline = ScrapePipeline::new(config, Arc::new(registry)).context("building http client")?;
    Ok(pipeline.run_once().await?)
}
