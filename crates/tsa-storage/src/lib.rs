//! Local sponsor CSV cache + retrying HTTP fetch utilities for TSA.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::{DateTime, Datelike, Local};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tsa-storage";

/// Cached CSV is refreshed once it is this many calendar months old.
pub const DEFAULT_FRESHNESS_MONTHS: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Calendar-month distance between two instants, ignoring the day of month.
pub fn months_between(modified: DateTime<Local>, now: DateTime<Local>) -> i64 {
    let years = i64::from(now.year()) - i64::from(modified.year());
    let months = i64::from(now.month()) - i64::from(modified.month());
    years * 12 + months
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedCsv {
    pub path: PathBuf,
    pub byte_size: u64,
    pub sha256: String,
}

/// The on-disk copy of the sponsor register.
#[derive(Debug, Clone)]
pub struct CsvCache {
    path: PathBuf,
}

impl CsvCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Modification time of the cached file, `None` when it does not exist.
    pub async fn modified_at(&self) -> Result<Option<DateTime<Local>>, CacheError> {
        let metadata = match fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(CacheError::io(
                    format!("reading metadata of {}", self.path.display()),
                    err,
                ))
            }
        };
        let modified: SystemTime = metadata
            .modified()
            .map_err(|e| CacheError::io(format!("reading mtime of {}", self.path.display()), e))?;
        Ok(Some(DateTime::<Local>::from(modified)))
    }

    pub async fn is_outdated(&self, months: u32) -> Result<bool, CacheError> {
        self.is_outdated_at(months, Local::now()).await
    }

    pub async fn is_outdated_at(&self, months: u32, now: DateTime<Local>) -> Result<bool, CacheError> {
        let Some(modified) = self.modified_at().await? else {
            debug!(path = %self.path.display(), "cached csv missing");
            return Ok(true);
        };
        Ok(months_between(modified, now) >= i64::from(months))
    }

    /// Opens a temp file beside the cache; nothing replaces the cached CSV
    /// until [`CacheWriter::commit`].
    pub async fn begin_write(&self) -> Result<CacheWriter, CacheError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| CacheError::io(format!("creating cache directory {}", parent.display()), e))?;

        let temp_path = parent.join(format!(".{}.csv.tmp", Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| CacheError::io(format!("opening temp file {}", temp_path.display()), e))?;

        Ok(CacheWriter {
            file,
            temp_path,
            final_path: self.path.clone(),
            hasher: Sha256::new(),
            byte_size: 0,
        })
    }

}

#[derive(Debug)]
pub struct CacheWriter {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    hasher: Sha256,
    byte_size: u64,
}

impl CacheWriter {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| CacheError::io(format!("writing {}", self.temp_path.display()), e))?;
        self.hasher.update(chunk);
        self.byte_size += chunk.len() as u64;
        Ok(())
    }

    pub async fn commit(mut self) -> Result<DownloadedCsv, CacheError> {
        if let Err(err) = self.file.flush().await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(CacheError::io(
                format!("flushing {}", self.temp_path.display()),
                err,
            ));
        }
        let Self {
            file,
            temp_path,
            final_path,
            hasher,
            byte_size,
        } = self;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(CacheError::io(
                format!(
                    "renaming {} -> {}",
                    temp_path.display(),
                    final_path.display()
                ),
                err,
            ));
        }

        Ok(DownloadedCsv {
            path: final_path,
            byte_size,
            sha256: hex::encode(hasher.finalize()),
        })
    }

    pub async fn abort(self) {
        let Self { file, temp_path, .. } = self;
        drop(file);
        let _ = fs::remove_file(&temp_path).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Deadline for the whole request including the body. Leave unset for
    /// large streamed downloads and rely on `read_timeout` instead.
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// Longest allowed gap between two reads of the response.
    pub read_timeout: Option<Duration>,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Honour `HTTP(S)_PROXY` from the environment.
    pub use_system_proxy: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(20)),
            connect_timeout: None,
            read_timeout: None,
            user_agent: None,
            backoff: BackoffPolicy::default(),
            use_system_proxy: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = config.read_timeout {
            builder = builder.read_timeout(timeout);
        }

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    async fn send_with_retry(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes_inner(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_bytes_inner(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.send_with_retry(url).await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    /// Streams `url` into `cache` chunk by chunk. The previous cached file
    /// stays in place if the transfer fails part-way.
    pub async fn download_to(&self, url: &str, cache: &CsvCache) -> Result<DownloadedCsv, FetchError> {
        self.download_inner(url, cache)
            .instrument(info_span!("http_download", url))
            .await
    }

    async fn download_inner(&self, url: &str, cache: &CsvCache) -> Result<DownloadedCsv, FetchError> {
        let mut resp = self.send_with_retry(url).await?;
        let mut writer = cache.begin_write().await?;

        match stream_body(&mut resp, &mut writer).await {
            Ok(()) => {
                let downloaded = writer.commit().await?;
                info!(
                    path = %downloaded.path.display(),
                    bytes = downloaded.byte_size,
                    sha256 = %downloaded.sha256,
                    "csv downloaded"
                );
                Ok(downloaded)
            }
            Err(err) => {
                writer.abort().await;
                Err(err)
            }
        }
    }
}

async fn stream_body(resp: &mut reqwest::Response, writer: &mut CacheWriter) -> Result<(), FetchError> {
    while let Some(chunk) = resp.chunk().await? {
        writer.write_chunk(&chunk).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    async fn store(cache: &CsvCache, bytes: &[u8]) {
        let mut writer = cache.begin_write().await.expect("begin");
        writer.write_chunk(bytes).await.expect("chunk");
        writer.commit().await.expect("commit");
    }

    fn local(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, 12, 0, 0).single().expect("ts")
    }

    #[test]
    fn sha256_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn month_distance_ignores_day_of_month() {
        assert_eq!(months_between(local(2026, 3, 31), local(2026, 4, 1)), 1);
        assert_eq!(months_between(local(2026, 4, 1), local(2026, 4, 30)), 0);
        assert_eq!(months_between(local(2025, 11, 15), local(2026, 2, 1)), 3);
    }

    #[tokio::test]
    async fn missing_cache_is_outdated() {
        let dir = tempdir().expect("tempdir");
        let cache = CsvCache::new(dir.path().join("sponsors.csv"));
        assert!(cache.is_outdated(1).await.expect("check"));
    }

    #[tokio::test]
    async fn freshly_written_cache_is_current() {
        let dir = tempdir().expect("tempdir");
        let cache = CsvCache::new(dir.path().join("sponsors.csv"));
        store(&cache, b"a,b\n1,2\n").await;
        let modified = cache.modified_at().await.expect("mtime").expect("exists");
        assert!(!cache.is_outdated_at(1, modified).await.expect("check"));
    }

    #[tokio::test]
    async fn cache_older_than_a_month_is_outdated() {
        let dir = tempdir().expect("tempdir");
        let cache = CsvCache::new(dir.path().join("sponsors.csv"));
        store(&cache, b"x").await;
        let modified = cache.modified_at().await.expect("mtime").expect("exists");
        let later = modified + chrono::Duration::days(100);
        assert!(cache.is_outdated_at(1, later).await.expect("check"));
    }

    #[tokio::test]
    async fn aborted_write_keeps_previous_file() {
        let dir = tempdir().expect("tempdir");
        let cache = CsvCache::new(dir.path().join("sponsors.csv"));
        store(&cache, b"old").await;

        let mut writer = cache.begin_write().await.expect("begin");
        writer.write_chunk(b"partial").await.expect("chunk");
        writer.abort().await;

        let content = std::fs::read(cache.path()).expect("read");
        assert_eq!(content, b"old");
        let leftovers = std::fs::read_dir(dir.path()).expect("dir").count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn committed_write_reports_hash_and_size() {
        let dir = tempdir().expect("tempdir");
        let cache = CsvCache::new(dir.path().join("nested").join("sponsors.csv"));
        let mut writer = cache.begin_write().await.expect("begin");
        writer.write_chunk(b"hello ").await.expect("chunk");
        writer.write_chunk(b"world").await.expect("chunk");
        let downloaded = writer.commit().await.expect("commit");
        assert_eq!(downloaded.byte_size, 11);
        assert_eq!(downloaded.sha256, sha256_hex(b"hello world"));
        assert_eq!(std::fs::read(cache.path()).expect("read"), b"hello world");
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
