use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::Store;
use super::types::{DashboardRecord, DatasetRecord};

impl Store {
    pub async fn get_dashboard(&self, dashboard_id: &str) -> Result<Option<DashboardRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                "SELECT id, user_id, title, refresh_reason, updated_at FROM dashboards WHERE id = ?1",
                params![dashboard_id],
                |row| {
                    Ok(DashboardRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        title: row.get(2)?,
                        refresh_reason: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(rec)
    }

    /// Move the dashboard's change watermark. The watermark never goes back in time.
    pub async fn bump_dashboard_watermark(
        &self,
        dashboard_id: &str,
        reason: &str,
        now: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE dashboards SET updated_at = MAX(updated_at + 1, ?3), refresh_reason = ?2
             WHERE id = ?1",
            params![dashboard_id, reason, now],
        )?;
        Ok(rows > 0)
    }

    /// Most recently registered dataset for a dashboard.
    pub async fn dataset_for_dashboard(&self, dashboard_id: &str) -> Result<Option<DatasetRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                "SELECT id, dashboard_id, file_id, db_path FROM datasets
                 WHERE dashboard_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![dashboard_id],
                dataset_from_row,
            )
            .optional()?;
        Ok(rec)
    }

    pub async fn dataset_by_file(&self, file_id: &str) -> Result<Option<DatasetRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                "SELECT id, dashboard_id, file_id, db_path FROM datasets WHERE file_id = ?1",
                params![file_id],
                dataset_from_row,
            )
            .optional()?;
        Ok(rec)
    }

    /// Dashboards and datasets are owned by the upload flow; these seed them in tests.
    #[cfg(test)]
    pub(crate) async fn create_dashboard(&self, id: &str, user_id: &str, title: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO dashboards (id, user_id, title, updated_at) VALUES (?1, ?2, ?3, 0)",
            params![id, user_id, title],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn register_dataset(
        &self,
        id: &str,
        dashboard_id: Option<&str>,
        file_id: Option<&str>,
        db_path: &str,
        now: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO datasets (id, dashboard_id, file_id, db_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, dashboard_id, file_id, db_path, now],
        )?;
        Ok(())
    }
}

fn dataset_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DatasetRecord> {
    Ok(DatasetRecord {
        id: row.get(0)?,
        dashboard_id: row.get(1)?,
        file_id: row.get(2)?,
        db_path: row.get(3)?,
    })
}
