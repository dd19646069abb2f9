//! Core domain model for TSA: sponsors, tracked applications, release metadata.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tsa-core";

/// Name of the imported sponsor register table.
pub const SPONSORS_TABLE: &str = "sponsors";

/// Columns surfaced by the sponsor browser, in display order.
pub const SPONSOR_BROWSE_COLUMNS: [&str; 5] = [
    "organisation_name",
    "town_city",
    "county",
    "type_and_rating",
    "route",
];

pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Key linking an application to a sponsor row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrgCity {
    pub organisation_name: String,
    pub city: String,
}

impl OrgCity {
    pub fn new(organisation_name: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            organisation_name: organisation_name.into(),
            city: city.into(),
        }
    }
}

/// User-editable part of an application record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplicationDraft {
    pub role: String,
    pub date: String,
    pub contact: String,
    pub note: String,
}

/// Persisted application record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub organisation_name: String,
    pub city: String,
    pub role: Option<String>,
    pub date: Option<String>,
    pub contact: Option<String>,
    pub note: Option<String>,
}

impl Application {
    pub fn org_city(&self) -> OrgCity {
        OrgCity::new(self.organisation_name.clone(), self.city.clone())
    }

    /// Current values as a draft, for pre-filling an edit.
    pub fn to_draft(&self) -> ApplicationDraft {
        ApplicationDraft {
            role: self.role.clone().unwrap_or_default(),
            date: self.date.clone().unwrap_or_default(),
            contact: self.contact.clone().unwrap_or_default(),
            note: self.note.clone().unwrap_or_default(),
        }
    }
}

/// One row of the sponsor browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorRow {
    /// Absolute 1-based position within the filtered result set.
    pub row_number: u64,
    pub organisation_name: String,
    pub town_city: String,
    pub county: String,
    pub type_and_rating: String,
    pub route: String,
    pub applied: bool,
}

impl SponsorRow {
    pub fn org_city(&self) -> OrgCity {
        OrgCity::new(self.organisation_name.clone(), self.town_city.clone())
    }
}

/// Free-text sponsor filters. Empty or whitespace-only values are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SponsorFilter {
    pub city: Option<String>,
    pub organisation: Option<String>,
}

impl SponsorFilter {
    pub fn new(city: Option<String>, organisation: Option<String>) -> Self {
        Self { city, organisation }
    }

    pub fn city_pattern(&self) -> Option<String> {
        self.city.as_deref().and_then(like_pattern)
    }

    pub fn organisation_pattern(&self) -> Option<String> {
        self.organisation.as_deref().and_then(like_pattern)
    }
}

/// Builds a lowercase LIKE pattern: one character matches as a prefix,
/// anything longer as a substring. `%`, `_` and `\` are escaped with `\`.
/// Only ASCII is folded, matching SQLite's `LOWER`.
pub fn like_pattern(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_ascii_lowercase();
    let mut escaped = String::with_capacity(lowered.len() + 2);
    for ch in lowered.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    if trimmed.chars().count() == 1 {
        Some(format!("{escaped}%"))
    } else {
        Some(format!("%{escaped}%"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorPage {
    pub rows: Vec<SponsorRow>,
    pub total: u64,
    /// Zero-based.
    pub page: u32,
    pub page_size: u32,
}

impl SponsorPage {
    pub fn total_pages(&self) -> u32 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.page_size)) as u32
    }

    pub fn has_next(&self) -> bool {
        self.page + 1 < self.total_pages()
    }

    pub fn has_prev(&self) -> bool {
        self.page > 0
    }

    pub fn next_page(&self) -> Option<u32> {
        self.has_next().then_some(self.page + 1)
    }

    /// Never goes below the first page.
    pub fn prev_page(&self) -> Option<u32> {
        self.page.checked_sub(1)
    }

    pub fn page_label(&self) -> String {
        format!("Page {}", self.page + 1)
    }

    pub fn result_label(&self) -> String {
        format!("{} results", self.total)
    }
}

/// Latest published release as reported by the release feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub tag: String,
    pub html_url: String,
    /// Platform installer if one was published, otherwise the release page.
    pub download_url: Option<String>,
    /// Release notes, markdown.
    pub changelog: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Parses `v1.2.3` / `1.2` into numeric components. Non-numeric parts fail.
pub fn parse_version(version: &str) -> Option<Vec<u64>> {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return None;
    }
    trimmed.split('.').map(|part| part.parse().ok()).collect()
}

/// True when `latest` is strictly newer than `current`. Unparseable tags are never newer.
pub fn is_newer_version(latest: &str, current: &str) -> bool {
    match (parse_version(latest), parse_version(current)) {
        (Some(l), Some(c)) => compare_versions(&l, &c) == Ordering::Greater,
        _ => false,
    }
}

fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
