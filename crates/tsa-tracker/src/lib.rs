//! SQLite data layer behind the front end: sponsor browsing and application tracking.

mod applications;
mod sponsors;

use thiserror::Error;

pub use applications::ApplicationRepo;
pub use sponsors::SponsorBrowser;

pub const CRATE_NAME: &str = "tsa-tracker";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("sponsors table is missing; run a sync first")]
    NoSponsorTable,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}
