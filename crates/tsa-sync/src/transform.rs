//! Sponsor register CSV -> normalized text table.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

/// Column name the loader reserves for its own primary key.
pub const RESERVED_ID_COLUMN: &str = "id";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("csv file not found at {0}")]
    NotFound(PathBuf),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("csv has no header row")]
    MissingHeader,
    #[error("column {0:?} appears more than once after normalization")]
    DuplicateColumn(String),
    #[error("column {0:?} collides with the generated primary key")]
    ReservedColumn(String),
}

/// Header-normalized CSV contents; every cell is text and rows are as wide as `columns`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SponsorTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SponsorTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// `Town/City` -> `town_city`, `Type & Rating` -> `type_and_rating`.
pub fn normalize_column_name(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim()
        .replace(' ', "_")
        .replace('/', "_")
        .replace('&', "and")
        .to_lowercase()
}

pub fn transform_csv(path: &Path) -> Result<SponsorTable, TransformError> {
    info!(path = %path.display(), "transforming csv");
    let file = std::fs::File::open(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            TransformError::NotFound(path.to_path_buf())
        } else {
            TransformError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    let table = transform_reader(file)?;
    info!(
        path = %path.display(),
        columns = table.columns.len(),
        rows = table.rows.len(),
        "csv transformed"
    );
    Ok(table)
}

pub fn transform_reader<R: Read>(reader: R) -> Result<SponsorTable, TransformError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(TransformError::MissingHeader);
    }

    let mut columns = Vec::with_capacity(headers.len());
    let mut seen = HashSet::new();
    for (index, raw) in headers.iter().enumerate() {
        let mut name = normalize_column_name(raw);
        if name.is_empty() {
            name = normalize_column_name(&format!("Unnamed: {index}"));
        }
        if name == RESERVED_ID_COLUMN {
            return Err(TransformError::ReservedColumn(name));
        }
        if !seen.insert(name.clone()) {
            return Err(TransformError::DuplicateColumn(name));
        }
        columns.push(name);
    }

    let width = columns.len();
    let mut rows = Vec::new();
    let mut overlong = 0usize;
    for record in reader.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        if record.len() > width {
            overlong += 1;
        }
        let mut row: Vec<String> = record.iter().take(width).map(str::to_string).collect();
        row.resize(width, String::new());
        rows.push(row);
    }
    if overlong > 0 {
        warn!(overlong, width, "dropped trailing cells beyond header width");
    }

    Ok(SponsorTable { columns, rows })
}
