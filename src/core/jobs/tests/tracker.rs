use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::jobs::{EphemeralStore, JobStatus, JobTracker, MemoryEphemeralStore};
use crate::core::store::Store;

/// Ephemeral store whose every call fails, like an unreachable Redis.
#[derive(Default)]
struct UnreachableEphemeral {
    calls: AtomicUsize,
}

#[async_trait]
impl EphemeralStore for UnreachableEphemeral {
    async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("connection refused"))
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("connection refused"))
    }
}

/// Ephemeral store that never answers.
struct HangingEphemeral;

#[async_trait]
impl EphemeralStore for HangingEphemeral {
    async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
        std::future::pending().await
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        std::future::pending().await
    }
}

/// In-memory store whose next put stalls for `stall_next_put_ms` before writing.
#[derive(Default)]
struct StallingEphemeral {
    inner: MemoryEphemeralStore,
    stall_next_put_ms: AtomicU64,
}

#[async_trait]
impl EphemeralStore for StallingEphemeral {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let stall = self.stall_next_put_ms.swap(0, Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }
        self.inner.put(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }
}

fn tracker_with(ephemeral: Arc<dyn EphemeralStore>) -> (Store, JobTracker) {
    let store = Store::open_in_memory().expect("store");
    let tracker = JobTracker::new(
        store.clone(),
        ephemeral,
        Duration::from_secs(60),
        Duration::from_millis(50),
    );
    (store, tracker)
}

#[tokio::test]
async fn create_twice_keeps_one_record_and_status() {
    let (store, tracker) = tracker_with(Arc::new(MemoryEphemeralStore::new()));
    assert!(tracker.create("r1", "u1", Some("d1")).await.unwrap());
    tracker
        .update_status("r1", JobStatus::Processing, Some(20))
        .await
        .unwrap();
    assert!(!tracker.create("r1", "u1", Some("d1")).await.unwrap());

    let job = store.get_job("r1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.progress, 20);
}

#[tokio::test]
async fn observed_status_never_regresses() {
    let (_store, tracker) = tracker_with(Arc::new(MemoryEphemeralStore::new()));
    tracker.create("j", "u", None).await.unwrap();

    let sequence = [
        (JobStatus::Processing, true),
        (JobStatus::Pending, false),
        (JobStatus::Processing, true),
        (JobStatus::Completed, true),
        (JobStatus::Processing, false),
        (JobStatus::Failed, false),
        (JobStatus::Pending, false),
    ];
    let rank = |s: JobStatus| match s {
        JobStatus::Pending => 0,
        JobStatus::Processing => 1,
        JobStatus::Completed | JobStatus::Failed => 2,
    };
    let mut last = JobStatus::Pending;
    for (status, expect_applied) in sequence {
        let applied = tracker.update_status("j", status, None).await.unwrap();
        assert_eq!(applied, expect_applied, "update to {:?}", status);
        let now = tracker.get_status("j").await.unwrap().unwrap().status;
        assert!(rank(now) >= rank(last), "{:?} regressed to {:?}", last, now);
        last = now;
    }
    assert_eq!(last, JobStatus::Completed);
}

#[tokio::test]
async fn unreachable_ephemeral_store_degrades_to_durable_only() {
    let ephemeral = Arc::new(UnreachableEphemeral::default());
    let (store, tracker) = tracker_with(ephemeral.clone());

    assert!(tracker.create("j", "u", None).await.unwrap());
    assert!(
        tracker
            .update_status("j", JobStatus::Processing, Some(40))
            .await
            .unwrap()
    );
    assert!(
        tracker
            .complete("j", &serde_json::json!({ "answer": "done" }))
            .await
            .unwrap()
    );
    assert!(tracker.create("k", "u", None).await.unwrap());
    assert!(tracker.fail("k", "delegate down").await.unwrap());

    let live = tracker.get_status("j").await.unwrap().unwrap();
    assert_eq!(live.status, JobStatus::Completed);
    assert_eq!(store.get_job("k").await.unwrap().unwrap().status, JobStatus::Failed);
    assert!(ephemeral.calls.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn hanging_ephemeral_store_is_bounded_by_timeout() {
    let (_store, tracker) = tracker_with(Arc::new(HangingEphemeral));
    let run = async {
        tracker.create("j", "u", None).await.unwrap();
        tracker
            .update_status("j", JobStatus::Processing, None)
            .await
            .unwrap();
        tracker.get_status("j").await.unwrap()
    };
    let snapshot = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("tracker must not hang on the ephemeral store");
    assert_eq!(snapshot.unwrap().status, JobStatus::Processing);
}

#[tokio::test]
async fn live_reads_prefer_ephemeral_then_fall_back_to_durable() {
    let ephemeral = Arc::new(MemoryEphemeralStore::new());
    let store = Store::open_in_memory().expect("store");
    // Very short TTL so the ephemeral copy expires during the test.
    let tracker = JobTracker::new(
        store.clone(),
        ephemeral.clone(),
        Duration::from_millis(20),
        Duration::from_millis(50),
    );
    tracker.create("j", "owner-1", Some("d1")).await.unwrap();
    assert!(ephemeral.get("job:j").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(ephemeral.get("job:j").await.unwrap().is_none());

    let snapshot = tracker.get_status("j").await.unwrap().unwrap();
    assert_eq!(snapshot.owner, "owner-1");
    assert_eq!(snapshot.dashboard_id.as_deref(), Some("d1"));
    assert!(tracker.get_status("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn every_durable_write_is_published_to_subscribers() {
    let (_store, tracker) = tracker_with(Arc::new(MemoryEphemeralStore::new()));
    let mut rx = tracker.subscribe();
    tracker.create("j", "u", None).await.unwrap();
    tracker
        .update_status("j", JobStatus::Processing, Some(50))
        .await
        .unwrap();
    tracker.fail("j", "boom").await.unwrap();
    // Rejected: nothing published.
    tracker.complete("j", &serde_json::json!({})).await.unwrap();

    let statuses: Vec<JobStatus> = (0..3).map(|_| rx.try_recv().unwrap().status).collect();
    assert_eq!(
        statuses,
        [JobStatus::Pending, JobStatus::Processing, JobStatus::Failed]
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn completion_records_durations() {
    let (store, tracker) = tracker_with(Arc::new(MemoryEphemeralStore::new()));
    tracker.create("j", "u", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    tracker
        .update_status("j", JobStatus::Processing, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    tracker.complete("j", &serde_json::json!({})).await.unwrap();

    let job = store.get_job("j").await.unwrap().unwrap();
    assert!(job.queue_time_ms.unwrap() >= 5);
    assert!(job.processing_time_ms.unwrap() >= 5);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn slow_mirror_of_an_older_row_never_overwrites_a_newer_one() {
    let ephemeral = Arc::new(StallingEphemeral::default());
    let store = Store::open_in_memory().expect("store");
    let tracker = JobTracker::new(
        store.clone(),
        ephemeral.clone(),
        Duration::from_secs(60),
        Duration::from_secs(1),
    );
    tracker.create("j", "u", None).await.unwrap();

    ephemeral.stall_next_put_ms.store(150, Ordering::SeqCst);
    let first = {
        let tracker = tracker.clone();
        tokio::spawn(async move {
            tracker
                .update_status("j", JobStatus::Processing, Some(10))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = {
        let tracker = tracker.clone();
        tokio::spawn(async move {
            tracker
                .update_status("j", JobStatus::Processing, Some(50))
                .await
        })
    };
    assert!(first.await.unwrap().unwrap());
    assert!(second.await.unwrap().unwrap());

    assert_eq!(store.get_job("j").await.unwrap().unwrap().progress, 50);
    let live = tracker.get_status("j").await.unwrap().unwrap();
    assert_eq!(live.progress, 50);
}
