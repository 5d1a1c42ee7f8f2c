use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row, params};

use super::Store;
use super::types::JobRecord;
use crate::core::jobs::{JobStatus, allowed_sources_sql};

const JOB_COLUMNS: &str = "id, user_id, dashboard_id, status, progress, error, result_json, attempts,
     queue_time_ms, processing_time_ms, created_at, started_at, completed_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let status: String = row.get(3)?;
    let result_json: Option<String> = row.get(6)?;
    Ok(JobRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        dashboard_id: row.get(2)?,
        status: JobStatus::from_status(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown job status '{}'", status).into(),
            )
        })?,
        progress: row.get::<_, i64>(4)?.clamp(0, 100) as u8,
        error: row.get(5)?,
        result: result_json.and_then(|j| serde_json::from_str(&j).ok()),
        attempts: row.get(7)?,
        queue_time_ms: row.get(8)?,
        processing_time_ms: row.get(9)?,
        created_at: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
    })
}

impl Store {
    /// Create-if-absent. Returns true when a new row was written.
    pub async fn insert_job_if_absent(
        &self,
        job_id: &str,
        user_id: &str,
        dashboard_id: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "INSERT OR IGNORE INTO jobs (id, user_id, dashboard_id, status, progress, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)",
            params![job_id, user_id, dashboard_id, now],
        )?;
        Ok(rows > 0)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(rec)
    }

    pub async fn increment_job_attempts(&self, job_id: &str) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE jobs SET attempts = attempts + 1 WHERE id = ?1",
            params![job_id],
        )?;
        let attempts = db
            .query_row(
                "SELECT attempts FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        attempts.ok_or_else(|| anyhow!("Job '{}' not found", job_id))
    }

    /// Move an active job to `pending`/`processing`. Progress never decreases.
    /// The first move into `processing` records `started_at` and the queue wait;
    /// the first progress update while already processing sets the baseline
    /// that `processing_time_ms` is measured from.
    pub async fn advance_job(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: Option<u8>,
        now: i64,
    ) -> Result<bool> {
        if status.is_terminal() {
            return Err(anyhow!("advance_job cannot move to terminal '{}'", status.as_str()));
        }
        let starting = status == JobStatus::Processing;
        let db = self.db.lock().await;
        let sql = format!(
            "UPDATE jobs SET
                status = ?2,
                progress = MAX(progress, COALESCE(?3, progress)),
                started_at = CASE WHEN ?5 THEN COALESCE(started_at, ?4) ELSE started_at END,
                queue_time_ms = CASE WHEN ?5 THEN COALESCE(queue_time_ms, ?4 - created_at) ELSE queue_time_ms END,
                processing_started_at = CASE WHEN ?5 AND status = 'processing'
                    THEN COALESCE(processing_started_at, ?4) ELSE processing_started_at END,
                updated_at = ?4
             WHERE id = ?1 AND status IN ({})",
            allowed_sources_sql(status)
        );
        let rows = db.execute(
            &sql,
            params![
                job_id,
                status.as_str(),
                progress.map(|p| p.min(100) as i64),
                now,
                starting
            ],
        )?;
        Ok(rows > 0)
    }

    /// Move an active job to `completed`/`failed` and record total processing
    /// time, from the processing baseline or, without one, from `started_at`.
    pub async fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(anyhow!("finish_job needs a terminal status, got '{}'", status.as_str()));
        }
        let result_json = result.map(serde_json::to_string).transpose()?;
        let db = self.db.lock().await;
        let sql = format!(
            "UPDATE jobs SET
                status = ?2,
                progress = CASE WHEN ?2 = 'completed' THEN 100 ELSE progress END,
                result_json = COALESCE(?3, result_json),
                error = COALESCE(?4, error),
                completed_at = ?5,
                processing_time_ms = ?5 - COALESCE(processing_started_at, started_at),
                updated_at = ?5
             WHERE id = ?1 AND status IN ({})",
            allowed_sources_sql(status)
        );
        let rows = db.execute(
            &sql,
            params![job_id, status.as_str(), result_json, error, now],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_is_idempotent() {
        let store = Store::open_in_memory().expect("store");
        assert!(store.insert_job_if_absent("j", "u", Some("d"), 10).await.unwrap());
        assert!(!store.insert_job_if_absent("j", "other", None, 20).await.unwrap());
        let job = store.get_job("j").await.unwrap().expect("job");
        assert_eq!(job.user_id, "u");
        assert_eq!(job.dashboard_id.as_deref(), Some("d"));
        assert_eq!(job.created_at, 10);
    }

    #[tokio::test]
    async fn processing_records_queue_wait_once_and_progress_is_monotone() {
        let store = Store::open_in_memory().expect("store");
        store.insert_job_if_absent("j", "u", None, 1_000).await.unwrap();
        assert!(store.advance_job("j", JobStatus::Processing, Some(10), 1_250).await.unwrap());
        assert!(store.advance_job("j", JobStatus::Processing, Some(60), 1_400).await.unwrap());
        assert!(store.advance_job("j", JobStatus::Processing, Some(30), 1_500).await.unwrap());

        let job = store.get_job("j").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 60);
        assert_eq!(job.started_at, Some(1_250));
        assert_eq!(job.queue_time_ms, Some(250));
    }

    #[tokio::test]
    async fn finishing_computes_processing_time_and_is_absorbing() {
        let store = Store::open_in_memory().expect("store");
        store.insert_job_if_absent("j", "u", None, 0).await.unwrap();
        store.advance_job("j", JobStatus::Processing, None, 100).await.unwrap();
        let result = serde_json::json!({ "answer": "ok" });
        assert!(
            store
                .finish_job("j", JobStatus::Completed, Some(&result), None, 900)
                .await
                .unwrap()
        );
        assert!(
            !store
                .finish_job("j", JobStatus::Failed, None, Some("late"), 950)
                .await
                .unwrap()
        );
        assert!(!store.advance_job("j", JobStatus::Processing, Some(5), 990).await.unwrap());

        let job = store.get_job("j").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.processing_time_ms, Some(800));
        assert_eq!(job.error, None);
        assert_eq!(job.result, Some(result));
    }

    #[tokio::test]
    async fn processing_time_runs_from_the_first_progress_update() {
        let store = Store::open_in_memory().expect("store");
        store.insert_job_if_absent("j", "u", None, 0).await.unwrap();
        store.advance_job("j", JobStatus::Processing, Some(5), 100).await.unwrap();
        store.advance_job("j", JobStatus::Processing, Some(10), 300).await.unwrap();
        store.advance_job("j", JobStatus::Processing, Some(40), 500).await.unwrap();
        store
            .finish_job("j", JobStatus::Completed, None, None, 900)
            .await
            .unwrap();

        let job = store.get_job("j").await.unwrap().unwrap();
        assert_eq!(job.started_at, Some(100));
        assert_eq!(job.queue_time_ms, Some(100));
        assert_eq!(job.processing_time_ms, Some(600));
    }

    #[tokio::test]
    async fn pending_job_cannot_complete_without_starting() {
        let store = Store::open_in_memory().expect("store");
        store.insert_job_if_absent("j", "u", None, 0).await.unwrap();
        assert!(!store.finish_job("j", JobStatus::Completed, None, None, 5).await.unwrap());
        assert!(store.finish_job("j", JobStatus::Failed, None, Some("boom"), 5).await.unwrap());
        let job = store.get_job("j").await.unwrap().unwrap();
        assert_eq!(job.processing_time_ms, None);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn attempts_are_counted_per_delivery() {
        let store = Store::open_in_memory().expect("store");
        store.insert_job_if_absent("j", "u", None, 0).await.unwrap();
        assert_eq!(store.increment_job_attempts("j").await.unwrap(), 1);
        assert_eq!(store.increment_job_attempts("j").await.unwrap(), 2);
        assert!(store.increment_job_attempts("missing").await.is_err());
    }
}
