//! Atomic replacement of the sponsors table from a transformed CSV.

use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::transform::SponsorTable;

/// Bind-parameter ceiling accepted by every SQLite build.
const SQLITE_MAX_BINDS: usize = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadSummary {
    pub rows_inserted: u64,
    pub rows_replaced: u64,
    /// Table was (re)created because it was missing or its columns changed.
    pub recreated: bool,
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `id` primary key followed by one TEXT column per CSV column.
pub fn create_table_sql(table: &str, columns: &[String]) -> String {
    let mut defs = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
    defs.extend(columns.iter().map(|c| format!("{} TEXT", quote_ident(c))));
    format!("CREATE TABLE {} ({})", quote_ident(table), defs.join(", "))
}

async fn existing_columns(
    conn: &mut sqlx::SqliteConnection,
    table: &str,
) -> Result<Option<Vec<String>>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("reading schema of {table}"))?;
    if rows.is_empty() {
        return Ok(None);
    }
    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("name").context("reading column name")?;
        if name != "id" {
            columns.push(name);
        }
    }
    Ok(Some(columns))
}

/// Replaces every row of `table` with `data` in a single transaction. The
/// table is recreated when its column set no longer matches; on any error the
/// previous contents stay in place.
pub async fn replace_table(pool: &SqlitePool, table: &str, data: &SponsorTable) -> Result<LoadSummary> {
    let quoted = quote_ident(table);
    let mut tx = pool.begin().await.context("starting load transaction")?;

    let mut summary = LoadSummary::default();
    match existing_columns(&mut *tx, table).await? {
        Some(columns) if columns == data.columns => {
            summary.rows_replaced = sqlx::query(&format!("DELETE FROM {quoted}"))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("clearing {table}"))?
                .rows_affected();
        }
        existing => {
            if existing.is_some() {
                let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {quoted}"))
                    .fetch_one(&mut *tx)
                    .await
                    .with_context(|| format!("counting {table}"))?;
                summary.rows_replaced = count.max(0) as u64;
                debug!(table, "column set changed, recreating table");
                sqlx::query(&format!("DROP TABLE {quoted}"))
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("dropping {table}"))?;
            }
            sqlx::query(&create_table_sql(table, &data.columns))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("creating {table}"))?;
            summary.recreated = true;
        }
    }

    if !data.columns.is_empty() {
        let column_list = data
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let rows_per_insert = (SQLITE_MAX_BINDS / data.columns.len()).max(1);
        for chunk in data.rows.chunks(rows_per_insert) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("INSERT INTO {quoted} ({column_list}) "));
            builder.push_values(chunk, |mut values, row| {
                for cell in row {
                    values.push_bind(cell.clone());
                }
            });
            summary.rows_inserted += builder
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting into {table}"))?
                .rows_affected();
        }
    }

    tx.commit().await.context("committing load transaction")?;
    info!(
        table,
        inserted = summary.rows_inserted,
        replaced = summary.rows_replaced,
        recreated = summary.recreated,
        "table replaced"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_database;
    use tempfile::tempdir;

    fn table(columns: &[&str], rows: &[&[&str]]) -> SponsorTable {
        SponsorTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        }
    }

    async fn names(pool: &SqlitePool) -> Vec<String> {
        sqlx::query_scalar("SELECT organisation_name FROM sponsors ORDER BY id")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[test]
    fn schema_is_flat_text_with_quoted_identifiers() {
        let sql = create_table_sql("sponsors", &["organisation_name".into(), "odd\"name".into()]);
        assert_eq!(
            sql,
            "CREATE TABLE \"sponsors\" (id INTEGER PRIMARY KEY AUTOINCREMENT, \"organisation_name\" TEXT, \"odd\"\"name\" TEXT)"
        );
    }

    #[tokio::test]
    async fn first_load_creates_table_and_inserts() {
        let dir = tempdir().unwrap();
        let pool = open_database(&dir.path().join("t.db")).await.unwrap();
        let data = table(&["organisation_name", "town_city"], &[&["Acme", "London"], &["Beta", "Leeds"]]);

        let summary = replace_table(&pool, "sponsors", &data).await.unwrap();
        assert_eq!(summary.rows_inserted, 2);
        assert_eq!(summary.rows_replaced, 0);
        assert!(summary.recreated);
        assert_eq!(names(&pool).await, vec!["Acme", "Beta"]);
    }

    #[tokio::test]
    async fn reload_replaces_previous_rows() {
        let dir = tempdir().unwrap();
        let pool = open_database(&dir.path().join("t.db")).await.unwrap();
        let cols = ["organisation_name", "town_city"];
        replace_table(&pool, "sponsors", &table(&cols, &[&["Old", "York"]]))
            .await
            .unwrap();

        let summary = replace_table(&pool, "sponsors", &table(&cols, &[&["New", "Bath"], &["Newer", "Hull"]]))
            .await
            .unwrap();
        assert_eq!(summary.rows_replaced, 1);
        assert!(!summary.recreated);
        assert_eq!(names(&pool).await, vec!["New", "Newer"]);
    }

    #[tokio::test]
    async fn changed_columns_recreate_the_table() {
        let dir = tempdir().unwrap();
        let pool = open_database(&dir.path().join("t.db")).await.unwrap();
        replace_table(&pool, "sponsors", &table(&["organisation_name"], &[&["Old"]]))
            .await
            .unwrap();

        let summary = replace_table(
            &pool,
            "sponsors",
            &table(&["organisation_name", "route"], &[&["New", "Skilled Worker"]]),
        )
        .await
        .unwrap();
        assert!(summary.recreated);
        assert_eq!(summary.rows_replaced, 1);
        let route: String = sqlx::query_scalar("SELECT route FROM sponsors")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(route, "Skilled Worker");
    }

    #[tokio::test]
    async fn large_loads_are_chunked_under_bind_limit() {
        let dir = tempdir().unwrap();
        let pool = open_database(&dir.path().join("t.db")).await.unwrap();
        let rows: Vec<Vec<String>> = (0..1500)
            .map(|i| vec![format!("Org {i}"), "London".to_string(), String::new()])
            .collect();
        let data = SponsorTable {
            columns: vec!["organisation_name".into(), "town_city".into(), "county".into()],
            rows,
        };
        let summary = replace_table(&pool, "sponsors", &data).await.unwrap();
        assert_eq!(summary.rows_inserted, 1500);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sponsors")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1500);
    }
}
