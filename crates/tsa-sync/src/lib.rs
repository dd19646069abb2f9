//! Sponsor register refresh pipeline: freshness check, fetch, transform, load.

pub mod config;
pub mod loader;
pub mod settings;
pub mod transform;

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, info_span, warn, Instrument};
use tsa_adapters::{PublicationSource, SponsorRegisterSource};
use tsa_core::SPONSORS_TABLE;
use tsa_storage::{CsvCache, DownloadedCsv, HttpClientConfig, HttpFetcher};
use uuid::Uuid;

pub use config::TsaConfig;
pub use loader::{replace_table, LoadSummary};
pub use settings::{LoadedSettings, Settings, SettingsStore};
pub use transform::{transform_csv, SponsorTable, TransformError};

pub const CRATE_NAME: &str = "tsa-sync";

const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Opens (creating if needed) the SQLite database at `path`.
pub async fn open_database(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("opening sqlite database {}", path.display()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Download even when the cached CSV is still fresh.
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub downloaded: bool,
    pub csv_url: Option<String>,
    pub csv_sha256: Option<String>,
    pub columns: usize,
    pub rows_loaded: u64,
    pub rows_replaced: u64,
    pub table_recreated: bool,
    pub db_path: String,
}

/// Outcome of the freshness + fetch stage.
#[derive(Debug, Clone)]
enum CacheState {
    Fresh,
    Downloaded { url: String, csv: DownloadedCsv },
    /// Refresh failed but an older copy is still usable.
    Stale,
}

pub struct SyncPipeline {
    config: TsaConfig,
    http: HttpFetcher,
    cache: CsvCache,
    source: Box<dyn PublicationSource>,
}

impl SyncPipeline {
    pub fn new(config: TsaConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: None,
            connect_timeout: Some(Duration::from_secs(CONNECT_TIMEOUT_SECS)),
            read_timeout: Some(Duration::from_secs(config.http_timeout_secs)),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let cache = CsvCache::new(config.csv_path.clone());
        let source = Box::new(SponsorRegisterSource::with_page_url(config.register_url.clone()));
        Ok(Self {
            config,
            http,
            cache,
            source,
        })
    }

    pub fn with_source(mut self, source: Box<dyn PublicationSource>) -> Self {
        self.source = source;
        self
    }

    pub fn cache(&self) -> &CsvCache {
        &self.cache
    }

    pub async fn run_once(&self, pool: &SqlitePool, options: SyncOptions) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run_stages(run_id, pool, options)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run_stages(&self, run_id: Uuid, pool: &SqlitePool, options: SyncOptions) -> Result<SyncRunSummary> {
        let started_at = Utc::now();

        let state = self.ensure_fresh(options.force).await?;
        let (downloaded, csv_url, csv_sha256) = match &state {
            CacheState::Downloaded { url, csv } => (true, Some(url.clone()), Some(csv.sha256.clone())),
            CacheState::Fresh | CacheState::Stale => (false, None, None),
        };

        let csv_path = self.cache.path().to_path_buf();
        let table = tokio::task::spawn_blocking(move || transform_csv(&csv_path))
            .await
            .context("transform task panicked")??;
        if table.is_empty() {
            bail!(
                "{} contains no sponsor rows; keeping the existing table",
                self.cache.path().display()
            );
        }

        let load = replace_table(pool, SPONSORS_TABLE, &table).await?;
        let finished_at = Utc::now();
        info!(
            rows = load.rows_inserted,
            downloaded,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "sponsor register synced"
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            downloaded,
            csv_url,
            csv_sha256,
            columns: table.columns.len(),
            rows_loaded: load.rows_inserted,
            rows_replaced: load.rows_replaced,
            table_recreated: load.recreated,
            db_path: self.config.db_path.display().to_string(),
        })
    }

    async fn ensure_fresh(&self, force: bool) -> Result<CacheState> {
        let outdated = self
            .cache
            .is_outdated(self.config.freshness_months)
            .await
            .context("checking csv freshness")?;
        if !force && !outdated {
            info!(path = %self.cache.path().display(), "csv file is up to date");
            return Ok(CacheState::Fresh);
        }
        info!(force, "csv file is outdated, updating");

        match self.download().await {
            Ok((url, csv)) => Ok(CacheState::Downloaded { url, csv }),
            Err(err) => {
                let has_copy = self
                    .cache
                    .modified_at()
                    .await
                    .context("checking cached csv")?
                    .is_some();
                if has_copy {
                    warn!(error = %err, "csv refresh failed, using cached copy");
                    Ok(CacheState::Stale)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn download(&self) -> Result<(String, DownloadedCsv)> {
        let url = self
            .source
            .locate_csv(&self.http)
            .await
            .with_context(|| format!("locating csv via {}", self.source.source_id()))?;
        let csv = self
            .http
            .download_to(&url, &self.cache)
            .await
            .with_context(|| format!("downloading {url}"))?;
        Ok((url, csv))
    }
}

/// Default register source, database at the configured path.
pub async fn run_sync_once(config: &TsaConfig, options: SyncOptions) -> Result<SyncRunSummary> {
    config.ensure_dirs()?;
    let pool = open_database(&config.db_path).await?;
    let pipeline = SyncPipeline::new(config.clone())?;
    let summary = pipeline.run_once(&pool, options).await;
    pool.close().await;
    summary
}
