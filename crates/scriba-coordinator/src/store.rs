//! Durable metadata store and queue primitives.
//!
//! Job records live in memory behind a single write lock and are
//! snapshotted to `jobs.json` (write-temp-then-rename) on every
//! mutation. The single lock is what makes `claim_one` linearizable:
//! two workers polling at once cannot observe the same eligible job.
//!
//! All stage/lease mutation goes through the operations here; HTTP
//! handlers never touch records directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use scriba_core::job::{JobId, JobRecord, JobStage};
use scriba_core::{Result, ScribaError};

pub struct MetadataStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    snapshot_path: PathBuf,
    max_retries: u32,
}

impl MetadataStore {
    /// Open the store, loading an existing snapshot if present.
    ///
    /// Jobs that were `running` when the coordinator died keep their
    /// lease fields; the reaper reclaims them once the lease expires.
    pub fn open(snapshot_path: impl Into<PathBuf>, max_retries: u32) -> Result<Self> {
        let snapshot_path = snapshot_path.into();
        let jobs = match std::fs::read(&snapshot_path) {
            Ok(raw) => {
                let records: Vec<JobRecord> = serde_json::from_slice(&raw).map_err(|e| {
                    ScribaError::Config(format!(
                        "metadata snapshot {} is corrupt: {e}",
                        snapshot_path.display()
                    ))
                })?;
                records.into_iter().map(|j| (j.id, j)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            jobs: RwLock::new(jobs),
            snapshot_path,
            max_retries,
        })
    }

    fn persist(&self, jobs: &HashMap<JobId, JobRecord>) -> Result<()> {
        let mut records: Vec<&JobRecord> = jobs.values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.to_string().cmp(&b.id.to_string())));
        let raw = serde_json::to_vec_pretty(&records)
            .map_err(|e| ScribaError::Other(format!("snapshot serialization failed: {e}")))?;

        let tmp = self.snapshot_path.with_extension("json.tmp");
        std::fs::write(&tmp, &raw)?;
        std::fs::rename(&tmp, &self.snapshot_path)?;
        if let Some(dir) = self.snapshot_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::File::open(dir)?.sync_all()?;
        }
        Ok(())
    }

    /// Create a job at stage `pending`, retry 0.
    pub fn insert_pending(
        &self,
        id: JobId,
        name: impl Into<String>,
        audio_key: impl Into<String>,
    ) -> Result<JobRecord> {
        let mut jobs = self.jobs.write();
        let record = JobRecord::new_pending(id, name, audio_key);
        jobs.insert(id, record.clone());
        self.persist(&jobs)?;
        Ok(record)
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.jobs.read().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.jobs.read().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Atomically pick one eligible job for `worker_id` and lease it.
    ///
    /// Eligible: stage `pending` or `failed_retryable`, or `running`
    /// with an expired lease. Tie-break is the earliest `created`
    /// instant so old jobs cannot starve. The claim itself never
    /// touches the retry counter.
    pub fn claim_one(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<JobRecord>> {
        let mut jobs = self.jobs.write();

        let candidate = jobs
            .values()
            .filter(|j| match j.stage {
                JobStage::Pending | JobStage::FailedRetryable => true,
                JobStage::Running => !j.is_leased(now),
                JobStage::Completed | JobStage::Failed => false,
            })
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
            })
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).ok_or_else(|| ScribaError::other("claimed job vanished"))?;
        job.stage = JobStage::Running;
        job.lease_holder = Some(worker_id.to_string());
        job.lease_acquired_at = Some(now);
        job.lease_expires_at = Some(now + chrono::Duration::seconds(lease_duration.as_secs() as i64));
        job.updated_at = now;
        let claimed = job.clone();

        self.persist(&jobs)?;
        Ok(Some(claimed))
    }

    /// Extend the lease iff `worker_id` still holds it and it has not
    /// expired. Returns the new expiry, or `None` when the lease is
    /// lost (the caller must answer 409 and the worker must abort).
    pub fn heartbeat(
        &self,
        id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.stage != JobStage::Running || !job.lease_held_by(worker_id, now) {
            return Ok(None);
        }

        let expiry = now + chrono::Duration::seconds(lease_duration.as_secs() as i64);
        job.lease_expires_at = Some(expiry);
        job.updated_at = now;
        self.persist(&jobs)?;
        Ok(Some(expiry))
    }

    /// Commit a completed job: set artifact keys, clear the lease.
    ///
    /// Only valid while `worker_id` holds a live lease. A replay on an
    /// already-completed job returns `true` without mutating anything,
    /// which makes the `complete` RPC idempotent.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_complete(
        &self,
        id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
        text_key: String,
        segments_key: Option<String>,
        summary: Option<String>,
        processing_seconds: f64,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.stage == JobStage::Completed {
            return Ok(true);
        }
        if job.stage != JobStage::Running || !job.lease_held_by(worker_id, now) {
            return Ok(false);
        }

        job.stage = JobStage::Completed;
        job.text_key = Some(text_key);
        job.segments_key = segments_key;
        job.summary = summary;
        job.processing_seconds = Some(processing_seconds);
        job.failure_reason = None;
        job.clear_lease();
        job.updated_at = now;
        job.completed_at = Some(now);
        self.persist(&jobs)?;
        Ok(true)
    }

    /// Commit a failure. Retryable failures below the retry cap go back
    /// to `failed_retryable`; everything else is terminal.
    pub fn commit_fail(
        &self,
        id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
        reason: &str,
        retryable: bool,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.stage == JobStage::Failed {
            // Replay of a terminal failure.
            return Ok(true);
        }
        if job.stage != JobStage::Running || !job.lease_held_by(worker_id, now) {
            return Ok(false);
        }

        if retryable && job.retry_count < self.max_retries {
            job.stage = JobStage::FailedRetryable;
            job.retry_count += 1;
        } else {
            job.stage = JobStage::Failed;
        }
        job.failure_reason = Some(reason.to_string());
        job.clear_lease();
        job.updated_at = now;
        self.persist(&jobs)?;
        Ok(true)
    }

    /// Return expired leases to the queue. Crash recovery for workers
    /// that died without a `fail` RPC.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut jobs = self.jobs.write();
        let mut reaped = 0;
        for job in jobs.values_mut() {
            if job.stage != JobStage::Running || job.is_leased(now) {
                continue;
            }
            if job.retry_count < self.max_retries {
                job.stage = JobStage::FailedRetryable;
                job.retry_count += 1;
            } else {
                job.stage = JobStage::Failed;
            }
            job.failure_reason = Some("lease expired".to_string());
            job.clear_lease();
            job.updated_at = now;
            reaped += 1;
        }
        if reaped > 0 {
            self.persist(&jobs)?;
        }
        Ok(reaped)
    }

    /// Terminal failures whose artifact blobs may be dangling.
    pub fn sweep_candidates(&self) -> Vec<JobRecord> {
        self.jobs
            .read()
            .values()
            .filter(|j| j.stage == JobStage::Failed)
            .cloned()
            .collect()
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(120);

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("jobs.json"), 3).unwrap();
        (dir, store)
    }

    fn insert(store: &MetadataStore, name: &str) -> JobId {
        let id = JobId::new();
        store
            .insert_pending(id, name, scriba_core::blob::audio_key(id, "wav"))
            .unwrap();
        id
    }

    #[test]
    fn claim_picks_oldest_created_first() {
        let (_dir, store) = store();
        let first = insert(&store, "first.wav");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _second = insert(&store, "second.wav");

        let claimed = store.claim_one("w1", Utc::now(), LEASE).unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.stage, JobStage::Running);
        assert_eq!(claimed.lease_holder.as_deref(), Some("w1"));
        assert_eq!(claimed.retry_count, 0);
    }

    #[test]
    fn at_most_one_worker_holds_a_lease() {
        let (_dir, store) = store();
        insert(&store, "only.wav");
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .claim_one(&format!("w{i}"), Utc::now(), LEASE)
                        .unwrap()
                        .is_some()
                })
            })
            .collect();

        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn heartbeat_extends_only_a_live_lease() {
        let (_dir, store) = store();
        let id = insert(&store, "a.wav");
        let t0 = Utc::now();
        store.claim_one("w1", t0, LEASE).unwrap().unwrap();

        // Wrong holder is rejected.
        assert!(store.heartbeat(id, "w2", t0, LEASE).unwrap().is_none());

        // Live lease extends.
        let t1 = t0 + chrono::Duration::seconds(30);
        let expiry = store.heartbeat(id, "w1", t1, LEASE).unwrap().unwrap();
        assert_eq!(expiry, t1 + chrono::Duration::seconds(120));

        // An expired lease cannot be revived by its old holder.
        let late = expiry + chrono::Duration::seconds(1);
        assert!(store.heartbeat(id, "w1", late, LEASE).unwrap().is_none());
    }

    #[test]
    fn commit_complete_requires_the_lease() {
        let (_dir, store) = store();
        let id = insert(&store, "a.wav");
        let now = Utc::now();
        store.claim_one("w1", now, LEASE).unwrap().unwrap();

        // A stranger cannot commit.
        assert!(!store
            .commit_complete(id, "w2", now, "t".into(), None, None, 1.0)
            .unwrap());

        assert!(store
            .commit_complete(id, "w1", now, "t".into(), Some("s".into()), Some("sum".into()), 1.0)
            .unwrap());
        let job = store.get(id).unwrap();
        assert_eq!(job.stage, JobStage::Completed);
        assert!(job.lease_holder.is_none());
        assert_eq!(job.text_key.as_deref(), Some("t"));

        // Replay is idempotent: same stage, no error.
        assert!(store
            .commit_complete(id, "w1", now, "t".into(), Some("s".into()), None, 1.0)
            .unwrap());
        assert_eq!(store.get(id).unwrap().summary.as_deref(), Some("sum"));
    }

    #[test]
    fn retryable_failures_requeue_until_the_cap() {
        let (_dir, store) = store();
        let id = insert(&store, "a.wav");

        for attempt in 1..=3u32 {
            let now = Utc::now();
            store.claim_one("w1", now, LEASE).unwrap().unwrap();
            assert!(store.commit_fail(id, "w1", now, "decoder exploded", true).unwrap());
            let job = store.get(id).unwrap();
            assert_eq!(job.stage, JobStage::FailedRetryable);
            assert_eq!(job.retry_count, attempt);
        }

        // Fourth failure exhausts the cap.
        let now = Utc::now();
        store.claim_one("w1", now, LEASE).unwrap().unwrap();
        assert!(store.commit_fail(id, "w1", now, "decoder exploded", true).unwrap());
        let job = store.get(id).unwrap();
        assert_eq!(job.stage, JobStage::Failed);
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.failure_reason.as_deref(), Some("decoder exploded"));
    }

    #[test]
    fn non_retryable_failure_is_terminal_immediately() {
        let (_dir, store) = store();
        let id = insert(&store, "zero-byte.wav");
        let now = Utc::now();
        store.claim_one("w1", now, LEASE).unwrap().unwrap();
        assert!(store
            .commit_fail(id, "w1", now, "audio decode error: empty file", false)
            .unwrap());
        let job = store.get(id).unwrap();
        assert_eq!(job.stage, JobStage::Failed);
        assert_eq!(job.retry_count, 0);
        assert!(job.text_key.is_none() && job.segments_key.is_none());
    }

    #[test]
    fn reaper_returns_expired_leases_to_the_queue() {
        let (_dir, store) = store();
        let id = insert(&store, "a.wav");
        let t0 = Utc::now();
        store.claim_one("w1", t0, LEASE).unwrap().unwrap();

        // Nothing to reap while the lease is live.
        assert_eq!(store.reap_expired(t0 + chrono::Duration::seconds(60)).unwrap(), 0);

        let late = t0 + chrono::Duration::seconds(121);
        assert_eq!(store.reap_expired(late).unwrap(), 1);
        let job = store.get(id).unwrap();
        assert_eq!(job.stage, JobStage::FailedRetryable);
        assert_eq!(job.retry_count, 1);

        // The job is claimable again; a commit from the dead worker
        // must now be rejected.
        let reclaimed = store.claim_one("w2", late, LEASE).unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert!(!store
            .commit_complete(id, "w1", late, "t".into(), None, None, 1.0)
            .unwrap());
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let id;
        {
            let store = MetadataStore::open(&path, 3).unwrap();
            id = insert(&store, "persisted.wav");
            store.claim_one("w1", Utc::now(), LEASE).unwrap().unwrap();
        }
        let store = MetadataStore::open(&path, 3).unwrap();
        let job = store.get(id).unwrap();
        assert_eq!(job.stage, JobStage::Running);
        assert_eq!(job.lease_holder.as_deref(), Some("w1"));
    }
}
