use std::collections::HashSet;

use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;
use tsa_core::{OrgCity, SponsorFilter, SponsorPage, SponsorRow, SPONSORS_TABLE, SPONSOR_BROWSE_COLUMNS};

use crate::TrackerError;

/// Filtered, paginated reads over the imported sponsor register.
#[derive(Debug, Clone)]
pub struct SponsorBrowser {
    pool: SqlitePool,
    page_size: u32,
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &SponsorFilter) {
    let mut first = true;
    let clauses = [
        ("town_city", filter.city_pattern()),
        ("organisation_name", filter.organisation_pattern()),
    ];
    for (column, pattern) in clauses {
        let Some(pattern) = pattern else { continue };
        builder.push(if first { " WHERE " } else { " AND " });
        first = false;
        builder
            .push(format!("LOWER({column}) LIKE "))
            .push_bind(pattern)
            .push(" ESCAPE '\\'");
    }
}

impl SponsorBrowser {
    pub fn new(pool: SqlitePool, page_size: u32) -> Self {
        Self {
            pool,
            page_size: page_size.max(1),
        }
    }

    async fn ensure_table(&self) -> Result<(), TrackerError> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(SPONSORS_TABLE)
                .fetch_optional(&self.pool)
                .await?;
        if found.is_none() {
            return Err(TrackerError::NoSponsorTable);
        }
        Ok(())
    }

    pub async fn count(&self, filter: &SponsorFilter) -> Result<u64, TrackerError> {
        self.ensure_table().await?;
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {SPONSORS_TABLE}"));
        push_filters(&mut builder, filter);
        let total: i64 = builder.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(total.max(0) as u64)
    }

    /// One page (zero-based) of sponsors matching `filter`; rows whose
    /// (organisation, city) is in `applied` are flagged.
    pub async fn page(
        &self,
        filter: &SponsorFilter,
        page: u32,
        applied: &HashSet<OrgCity>,
    ) -> Result<SponsorPage, TrackerError> {
        let total = self.count(filter).await?;
        let offset = u64::from(page) * u64::from(self.page_size);

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {SPONSORS_TABLE}",
            SPONSOR_BROWSE_COLUMNS.join(", ")
        ));
        push_filters(&mut builder, filter);
        builder
            .push(" ORDER BY id LIMIT ")
            .push_bind(i64::from(self.page_size))
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            let text = |column: &str| -> Result<String, sqlx::Error> {
                Ok(row.try_get::<Option<String>, _>(column)?.unwrap_or_default())
            };
            let mut sponsor = SponsorRow {
                row_number: offset + idx as u64 + 1,
                organisation_name: text("organisation_name")?,
                town_city: text("town_city")?,
                county: text("county")?,
                type_and_rating: text("type_and_rating")?,
                route: text("route")?,
                applied: false,
            };
            sponsor.applied = applied.contains(&sponsor.org_city());
            out.push(sponsor);
        }

        debug!(page, total, returned = out.len(), "sponsor page loaded");
        Ok(SponsorPage {
            rows: out,
            total,
            page,
            page_size: self.page_size,
        })
    }
}
