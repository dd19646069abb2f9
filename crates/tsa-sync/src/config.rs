use std::path::PathBuf;

use anyhow::{Context, Result};
use tsa_adapters::{REGISTER_PAGE_URL, RELEASE_FEED_URL};
use tsa_core::DEFAULT_PAGE_SIZE;
use tsa_storage::DEFAULT_FRESHNESS_MONTHS;

pub const CSV_FILENAME: &str = "sponsors.csv";
pub const DB_FILENAME: &str = "sponsorship.db";
pub const SETTINGS_FILENAME: &str = "settings.json";
pub const LOG_FILENAME: &str = "app.log";

/// Filesystem layout and remote endpoints, resolved from the environment.
#[derive(Debug, Clone)]
pub struct TsaConfig {
    pub home_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub csv_path: PathBuf,
    pub db_path: PathBuf,
    pub settings_path: PathBuf,
    pub log_file: PathBuf,
    pub register_url: String,
    pub release_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub release_timeout_secs: u64,
    pub page_size: u32,
    pub freshness_months: u32,
}

impl TsaConfig {
    /// Layout rooted at `home` with built-in defaults; no environment lookups.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home_dir = home.into();
        let data_dir = home_dir.join("data");
        let log_dir = home_dir.join("logs");
        Self {
            csv_path: data_dir.join(CSV_FILENAME),
            db_path: data_dir.join(DB_FILENAME),
            settings_path: data_dir.join(SETTINGS_FILENAME),
            log_file: log_dir.join(LOG_FILENAME),
            home_dir,
            data_dir,
            log_dir,
            register_url: REGISTER_PAGE_URL.to_string(),
            release_url: RELEASE_FEED_URL.to_string(),
            user_agent: format!("tsa/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 60,
            release_timeout_secs: 3,
            page_size: DEFAULT_PAGE_SIZE,
            freshness_months: DEFAULT_FRESHNESS_MONTHS,
        }
    }

    /// `home` wins over `TSA_HOME`, which wins over `~/TSA`.
    pub fn from_env(home: Option<PathBuf>) -> Self {
        let home = home
            .or_else(|| std::env::var("TSA_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(default_home);
        let mut config = Self::with_home(home);

        if let Ok(url) = std::env::var("TSA_REGISTER_URL") {
            config.register_url = url;
        }
        if let Ok(url) = std::env::var("TSA_RELEASE_URL") {
            config.release_url = url;
        }
        if let Ok(agent) = std::env::var("TSA_USER_AGENT") {
            config.user_agent = agent;
        }
        config.http_timeout_secs = env_parse("TSA_HTTP_TIMEOUT_SECS").unwrap_or(config.http_timeout_secs);
        config.page_size = env_parse("TSA_PAGE_SIZE")
            .filter(|size: &u32| *size > 0)
            .unwrap_or(config.page_size);
        config
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.log_dir] {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn default_home() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("TSA")
}
