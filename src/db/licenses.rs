use super::models::{License, LicenseStatus};
use super::{json_column, Database, DbResult};
use rusqlite::{params, OptionalExtension, Row};

const LICENSE_COLUMNS: &str =
    "id, user_id, license_key, plan, status, features, started_at, expires_at, created_at";

fn license_from_row(row: &Row<'_>) -> rusqlite::Result<License> {
    Ok(License {
        id: row.get(0)?,
        user_id: row.get(1)?,
        license_key: row.get(2)?,
        plan: row.get(3)?,
        status: row.get(4)?,
        features: json_column(row, 5)?,
        started_at: row.get(6)?,
        expires_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl Database {
    // ── Licenses ──

    /// Inserts a license row. A reused key fails on the UNIQUE constraint
    /// (see [`DbError::is_unique_violation`](super::DbError::is_unique_violation)).
    pub fn insert_license(&self, license: &License) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO licenses (id, user_id, license_key, plan, status, features, started_at, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                license.id,
                license.user_id,
                license.license_key,
                license.plan,
                license.status,
                serde_json::to_string(&license.features)?,
                license.started_at,
                license.expires_at,
                license.created_at
            ],
        )?;
        Ok(())
    }

    pub fn license_key_exists(&self, license_key: &str) -> DbResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM licenses WHERE license_key = ?1",
                params![license_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Most recently created license with status `active`, expired or not.
    pub fn latest_active_license(&self, user_id: &str) -> DbResult<Option<License>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {LICENSE_COLUMNS} FROM licenses
                     WHERE user_id = ?1 AND status = ?2
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT 1"
                ),
                params![user_id, LicenseStatus::Active],
                license_from_row,
            )
            .optional()?)
    }

    pub fn get_license(&self, id: &str) -> DbResult<Option<License>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {LICENSE_COLUMNS} FROM licenses WHERE id = ?1"),
                params![id],
                license_from_row,
            )
            .optional()?)
    }

    pub fn set_license_status(&self, id: &str, status: LicenseStatus) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE licenses SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(())
    }
}
