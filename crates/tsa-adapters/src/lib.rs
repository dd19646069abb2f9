//! Remote source adapters: the sponsor register publication page and the release feed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use tsa_core::ReleaseInfo;
use tsa_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "tsa-adapters";

pub const REGISTER_PAGE_URL: &str =
    "https://www.gov.uk/government/publications/register-of-licensed-sponsors-workers";
pub const REGISTER_ASSET_HOST: &str = "https://assets.publishing.service.gov.uk";
pub const REGISTER_CSV_MARKER: &str = "Worker_and_Temporary_Worker.csv";
pub const RELEASE_FEED_URL: &str = "https://api.github.com/repos/ugurserhattoy/TSA/releases/latest";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no link containing {marker} found on {page_url}")]
    CsvLinkNotFound { marker: String, page_url: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed release payload: {0}")]
    ReleasePayload(#[from] serde_json::Error),
}

/// A page that publishes a downloadable CSV.
#[async_trait]
pub trait PublicationSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Resolves the absolute URL of the current CSV asset.
    async fn locate_csv(&self, http: &HttpFetcher) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct SponsorRegisterSource {
    pub page_url: String,
    pub asset_host: String,
    pub marker: String,
}

impl Default for SponsorRegisterSource {
    fn default() -> Self {
        Self {
            page_url: REGISTER_PAGE_URL.to_string(),
            asset_host: REGISTER_ASSET_HOST.to_string(),
            marker: REGISTER_CSV_MARKER.to_string(),
        }
    }
}

impl SponsorRegisterSource {
    pub fn with_page_url(page_url: impl Into<String>) -> Self {
        Self {
            page_url: page_url.into(),
            ..Self::default()
        }
    }

    pub fn extract_csv_link(&self, html: &str) -> Result<String, AdapterError> {
        extract_csv_link(html, &self.marker, &self.asset_host).ok_or_else(|| {
            AdapterError::CsvLinkNotFound {
                marker: self.marker.clone(),
                page_url: self.page_url.clone(),
            }
        })
    }
}

#[async_trait]
impl PublicationSource for SponsorRegisterSource {
    fn source_id(&self) -> &'static str {
        "uk-sponsor-register"
    }

    async fn locate_csv(&self, http: &HttpFetcher) -> Result<String, AdapterError> {
        let page = http.fetch_bytes(&self.page_url).await?;
        let link = self.extract_csv_link(&page.text())?;
        info!(source = self.source_id(), %link, "located sponsor csv");
        Ok(link)
    }
}

/// First `a[href]` in document order whose href contains `marker`.
/// Relative hrefs are resolved against `asset_host`.
pub fn extract_csv_link(html: &str, marker: &str, asset_host: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").ok()?;
    document
        .select(&selector)
        .filter_map(|node| node.value().attr("href"))
        .find(|href| href.contains(marker))
        .map(|href| absolutize(href, asset_host))
}

fn absolutize(href: &str, asset_host: &str) -> String {
    if href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{}{}", asset_host.trim_end_matches('/'), href)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => Self::Windows,
            "macos" => Self::MacOs,
            "linux" => Self::Linux,
            _ => Self::Other,
        }
    }

    fn installer_suffix(self) -> Option<&'static str> {
        match self {
            Self::Windows => Some(".exe"),
            Self::MacOs => Some(".dmg"),
            Self::Linux => Some(".appimage"),
            Self::Other => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ReleasePayload {
    tag_name: String,
    html_url: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// Installer for `platform`; the release page when assets exist but none fit;
/// nothing when the release has no assets.
pub fn select_asset(assets: &[ReleaseAsset], html_url: &str, platform: Platform) -> Option<String> {
    if let Some(suffix) = platform.installer_suffix() {
        if let Some(asset) = assets
            .iter()
            .find(|a| a.name.to_ascii_lowercase().ends_with(suffix))
        {
            return Some(asset.browser_download_url.clone());
        }
    }
    if assets.is_empty() {
        None
    } else {
        debug!("no installer asset for platform, using release page");
        Some(html_url.to_string())
    }
}

pub fn parse_release(json: &str, platform: Platform) -> Result<ReleaseInfo, AdapterError> {
    let payload: ReleasePayload = serde_json::from_str(json)?;
    let download_url = select_asset(&payload.assets, &payload.html_url, platform);
    Ok(ReleaseInfo {
        tag: payload.tag_name,
        html_url: payload.html_url,
        download_url,
        changelog: payload.body.unwrap_or_default(),
        published_at: payload.published_at,
    })
}

#[derive(Debug, Clone)]
pub struct ReleaseFeed {
    pub url: String,
    pub platform: Platform,
}

impl Default for ReleaseFeed {
    fn default() -> Self {
        Self {
            url: RELEASE_FEED_URL.to_string(),
            platform: Platform::current(),
        }
    }
}

impl ReleaseFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Latest release, or `None` when the feed is unreachable or answers
    /// with a non-success status.
    pub async fn latest(&self, http: &HttpFetcher) -> Result<Option<ReleaseInfo>, AdapterError> {
        let fetched = match http.fetch_bytes(&self.url).await {
            Ok(fetched) => fetched,
            Err(err @ (FetchError::HttpStatus { .. } | FetchError::Request(_))) => {
                debug!(error = %err, url = %self.url, "release feed unavailable");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        parse_release(&fetched.text(), self.platform).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture(rel: &str) -> String {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(rel);
        std::fs::read_to_string(&path).unwrap()
    }

    #[test]
    fn first_matching_link_is_resolved_against_asset_host() {
        let source = SponsorRegisterSource::default();
        let link = source
            .extract_csv_link(&fixture("register/publication_page.html"))
            .unwrap();
        assert_eq!(
            link,
            "https://assets.publishing.service.gov.uk/media/6650f1b2a2/2026-10-14_-_Worker_and_Temporary_Worker.csv"
        );
    }

    #[test]
    fn absolute_links_are_kept() {
        let html = r#"<a href="/other.csv">x</a><a href="https://cdn.example/Worker_and_Temporary_Worker.csv">y</a>"#;
        let link = extract_csv_link(html, REGISTER_CSV_MARKER, REGISTER_ASSET_HOST).unwrap();
        assert_eq!(link, "https://cdn.example/Worker_and_Temporary_Worker.csv");
    }

    #[test]
    fn missing_link_is_an_error() {
        let source = SponsorRegisterSource::with_page_url("https://example.test/page");
        let err = source
            .extract_csv_link("<html><a href='/x.pdf'>pdf</a></html>")
            .unwrap_err();
        assert!(matches!(err, AdapterError::CsvLinkNotFound { .. }));
        assert!(err.to_string().contains("https://example.test/page"));
    }

    #[test]
    fn release_picks_installer_per_platform() {
        let json = fixture("release/latest.json");
        let linux = parse_release(&json, Platform::Linux).unwrap();
        assert_eq!(linux.tag, "v0.7.0");
        assert!(linux
            .download_url
            .as_deref()
            .unwrap()
            .ends_with("x86_64.AppImage"));
        assert!(linux.changelog.starts_with("## Changes"));
        assert!(linux.published_at.is_some());

        let windows = parse_release(&json, Platform::Windows).unwrap();
        assert!(windows.download_url.as_deref().unwrap().ends_with(".exe"));

        let mac = parse_release(&json, Platform::MacOs).unwrap();
        assert!(mac.download_url.as_deref().unwrap().ends_with(".dmg"));
    }

    #[test]
    fn unknown_platform_falls_back_to_release_page() {
        let json = fixture("release/latest.json");
        let other = parse_release(&json, Platform::Other).unwrap();
        assert_eq!(other.download_url.as_deref(), Some(other.html_url.as_str()));
    }

    #[test]
    fn release_without_assets_has_no_download() {
        let json = r#"{"tag_name":"v1.0.0","html_url":"https://github.com/x/y/releases/tag/v1.0.0"}"#;
        let info = parse_release(json, Platform::Linux).unwrap();
        assert_eq!(info.download_url, None);
        assert_eq!(info.changelog, "");
    }

    #[tokio::test]
    async fn unreachable_release_feed_is_silenced() {
        let http = HttpFetcher::new(tsa_storage::HttpClientConfig {
            timeout: Some(std::time::Duration::from_secs(3)),
            backoff: tsa_storage::BackoffPolicy {
                max_retries: 0,
                ..Default::default()
            },
            use_system_proxy: false,
            ..Default::default()
        })
        .unwrap();
        let feed = ReleaseFeed::new("http://127.0.0.1:1/releases/latest");
        assert_eq!(feed.latest(&http).await.unwrap(), None);
    }

    #[test]
    fn malformed_release_payload_is_rejected() {
        let err = parse_release("{\"html_url\": 3}", Platform::Linux).unwrap_err();
        assert!(matches!(err, AdapterError::ReleasePayload(_)));
    }
}
