//! Dual-write job lifecycle tracking.
//!
//! The durable store is the source of truth and every operation writes it
//! first. After a successful write the resulting row is re-read, published to
//! live observers and mirrored into the ephemeral store. Ephemeral failures are
//! logged and swallowed here and nowhere else.
//!
//! The re-read and the ephemeral put for one job happen under a per-job lock
//! (striped by id), so a slow mirror of an older row can never land after the
//! mirror of a newer one.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

use super::{EphemeralStore, JobStatus};
use crate::core::store::Store;
use crate::core::store::now_ms;
use crate::core::store::types::JobRecord;

/// Live view of a job, as mirrored to the ephemeral store and streamed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub owner: String,
    pub dashboard_id: Option<String>,
    pub queue_time_ms: Option<i64>,
    pub processing_time_ms: Option<i64>,
}

impl From<JobRecord> for JobSnapshot {
    fn from(rec: JobRecord) -> Self {
        Self {
            job_id: rec.id,
            status: rec.status,
            progress: rec.progress,
            error: rec.error,
            result: rec.result,
            owner: rec.user_id,
            dashboard_id: rec.dashboard_id,
            queue_time_ms: rec.queue_time_ms,
            processing_time_ms: rec.processing_time_ms,
        }
    }
}

/// Published after every durable write.
pub type JobUpdate = JobSnapshot;

#[derive(Clone)]
pub struct JobTracker {
    store: Store,
    ephemeral: Arc<dyn EphemeralStore>,
    ttl: Duration,
    op_timeout: Duration,
    updates: broadcast::Sender<JobUpdate>,
    mirror_locks: Arc<Vec<Mutex<()>>>,
}

const MIRROR_STRIPES: usize = 16;

fn ephemeral_key(job_id: &str) -> String {
    format!("job:{}", job_id)
}

impl JobTracker {
    pub fn new(
        store: Store,
        ephemeral: Arc<dyn EphemeralStore>,
        ttl: Duration,
        op_timeout: Duration,
    ) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            store,
            ephemeral,
            ttl,
            op_timeout,
            updates,
            mirror_locks: Arc::new((0..MIRROR_STRIPES).map(|_| Mutex::new(())).collect()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.updates.subscribe()
    }

    /// Create-if-absent; a second call for the same id changes nothing.
    pub async fn create(
        &self,
        job_id: &str,
        user_id: &str,
        dashboard_id: Option<&str>,
    ) -> Result<bool> {
        let created = self
            .store
            .insert_job_if_absent(job_id, user_id, dashboard_id, now_ms())
            .await?;
        if created {
            self.mirror(job_id).await?;
        } else {
            debug!("Job {} already exists, create is a no-op", job_id);
        }
        Ok(created)
    }

    /// Count one more delivery of this job.
    pub async fn record_attempt(&self, job_id: &str) -> Result<i64> {
        self.store.increment_job_attempts(job_id).await
    }

    /// Returns false (and writes nothing) when the move would go backwards.
    pub async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: Option<u8>,
    ) -> Result<bool> {
        let now = now_ms();
        let applied = if status.is_terminal() {
            self.store
                .finish_job(job_id, status, None, None, now)
                .await?
        } else {
            self.store.advance_job(job_id, status, progress, now).await?
        };
        self.after_write(job_id, status, applied).await
    }

    pub async fn complete(&self, job_id: &str, result: &Value) -> Result<bool> {
        let applied = self
            .store
            .finish_job(job_id, JobStatus::Completed, Some(result), None, now_ms())
            .await?;
        self.after_write(job_id, JobStatus::Completed, applied).await
    }

    pub async fn fail(&self, job_id: &str, error: &str) -> Result<bool> {
        let applied = self
            .store
            .finish_job(job_id, JobStatus::Failed, None, Some(error), now_ms())
            .await?;
        self.after_write(job_id, JobStatus::Failed, applied).await
    }

    /// Live read: ephemeral copy first, durable record when absent or unreachable.
    pub async fn get_status(&self, job_id: &str) -> Result<Option<JobSnapshot>> {
        let key = ephemeral_key(job_id);
        match tokio::time::timeout(self.op_timeout, self.ephemeral.get(&key)).await {
            Ok(Ok(Some(raw))) => match serde_json::from_str::<JobSnapshot>(&raw) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => warn!("Discarding unreadable ephemeral snapshot for {}: {}", job_id, e),
            },
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!("Ephemeral read failed for job {}: {}", job_id, e),
            Err(_) => warn!("Ephemeral read timed out for job {}", job_id),
        }

        let _guard = self.mirror_lock(job_id).lock().await;
        let Some(rec) = self.store.get_job(job_id).await? else {
            return Ok(None);
        };
        let snapshot = JobSnapshot::from(rec);
        self.put_ephemeral(&snapshot).await;
        Ok(Some(snapshot))
    }

    /// Durable history record.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.store.get_job(job_id).await
    }

    async fn after_write(&self, job_id: &str, status: JobStatus, applied: bool) -> Result<bool> {
        if applied {
            self.mirror(job_id).await?;
        } else {
            debug!(
                "Ignoring transition of job {} to {}: not allowed from its current state",
                job_id,
                status.as_str()
            );
        }
        Ok(applied)
    }

    fn mirror_lock(&self, job_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        job_id.hash(&mut hasher);
        &self.mirror_locks[hasher.finish() as usize % self.mirror_locks.len()]
    }

    async fn mirror(&self, job_id: &str) -> Result<()> {
        let _guard = self.mirror_lock(job_id).lock().await;
        let Some(rec) = self.store.get_job(job_id).await? else {
            return Ok(());
        };
        let snapshot = JobSnapshot::from(rec);
        // No receivers is fine.
        let _ = self.updates.send(snapshot.clone());
        self.put_ephemeral(&snapshot).await;
        Ok(())
    }

    async fn put_ephemeral(&self, snapshot: &JobSnapshot) {
        let raw = match serde_json::to_string(snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Could not encode snapshot for job {}: {}", snapshot.job_id, e);
                return;
            }
        };
        let key = ephemeral_key(&snapshot.job_id);
        match tokio::time::timeout(self.op_timeout, self.ephemeral.put(&key, raw, self.ttl)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "Ephemeral write failed for job {} (durable copy kept): {}",
                snapshot.job_id, e
            ),
            Err(_) => warn!(
                "Ephemeral write timed out for job {} (durable copy kept)",
                snapshot.job_id
            ),
        }
    }
}
