use std::collections::HashSet;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;
use tsa_core::{Application, ApplicationDraft, OrgCity};

use crate::TrackerError;

const CREATE_APPLICATIONS: &str = "CREATE TABLE IF NOT EXISTS applications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    organisation_name TEXT NOT NULL,
    city TEXT NOT NULL,
    role TEXT,
    date TEXT,
    contact TEXT,
    note TEXT
)";

/// CRUD over the `applications` table. Records are linked to sponsors by
/// (organisation name, city); several applications per sponsor are allowed.
#[derive(Debug, Clone)]
pub struct ApplicationRepo {
    pool: SqlitePool,
}

fn application_from_row(row: &SqliteRow) -> Result<Application, sqlx::Error> {
    Ok(Application {
        id: row.try_get("id")?,
        organisation_name: row.try_get("organisation_name")?,
        city: row.try_get("city")?,
        role: row.try_get("role")?,
        date: row.try_get("date")?,
        contact: row.try_get("contact")?,
        note: row.try_get("note")?,
    })
}

impl ApplicationRepo {
    /// Wraps `pool`, creating the table if it does not exist yet.
    pub async fn open(pool: SqlitePool) -> Result<Self, TrackerError> {
        sqlx::query(CREATE_APPLICATIONS).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn add(&self, key: &OrgCity, draft: &ApplicationDraft) -> Result<i64, TrackerError> {
        let id = sqlx::query(
            "INSERT INTO applications (organisation_name, city, role, date, contact, note)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&key.organisation_name)
        .bind(&key.city)
        .bind(&draft.role)
        .bind(&draft.date)
        .bind(&draft.contact)
        .bind(&draft.note)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        info!(
            id,
            org = %key.organisation_name,
            city = %key.city,
            "[APPLICATION] added"
        );
        Ok(id)
    }

    /// Newest first by the user-entered date.
    pub async fn list_for(&self, key: &OrgCity) -> Result<Vec<Application>, TrackerError> {
        let rows = sqlx::query(
            "SELECT id, organisation_name, city, role, date, contact, note
             FROM applications
             WHERE organisation_name = ? AND city = ?
             ORDER BY date DESC, id DESC",
        )
        .bind(&key.organisation_name)
        .bind(&key.city)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(application_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(TrackerError::from)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Application>, TrackerError> {
        let row = sqlx::query(
            "SELECT id, organisation_name, city, role, date, contact, note
             FROM applications WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(application_from_row)
            .transpose()
            .map_err(TrackerError::from)
    }

    /// Returns `false` when no application has `id`.
    pub async fn update(&self, id: i64, draft: &ApplicationDraft) -> Result<bool, TrackerError> {
        let affected = sqlx::query(
            "UPDATE applications SET role = ?, date = ?, contact = ?, note = ? WHERE id = ?",
        )
        .bind(&draft.role)
        .bind(&draft.date)
        .bind(&draft.contact)
        .bind(&draft.note)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected > 0 {
            info!(id, role = %draft.role, "[APPLICATION] updated");
        }
        Ok(affected > 0)
    }

    pub async fn delete(&self, id: i64) -> Result<bool, TrackerError> {
        let affected = sqlx::query("DELETE FROM applications WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected > 0 {
            info!(id, "[APPLICATION] deleted");
        }
        Ok(affected > 0)
    }

    pub async fn has_application(&self, key: &OrgCity) -> Result<bool, TrackerError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM applications WHERE organisation_name = ? AND city = ?",
        )
        .bind(&key.organisation_name)
        .bind(&key.city)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Every (organisation, city) with at least one application.
    pub async fn org_city_pairs(&self) -> Result<HashSet<OrgCity>, TrackerError> {
        let rows = sqlx::query("SELECT DISTINCT organisation_name, city FROM applications")
            .fetch_all(&self.pool)
            .await?;
        let mut pairs = HashSet::with_capacity(rows.len());
        for row in rows {
            pairs.insert(OrgCity {
                organisation_name: row.try_get("organisation_name")?,
                city: row.try_get("city")?,
            });
        }
        Ok(pairs)
    }
}
