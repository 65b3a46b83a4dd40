//! Job store
//!
//! The store holds the Job aggregate (job, archives, file entries). Every
//! read returns the full aggregate. Writes after the initial persist go
//! through [`JobStore::update`], a compare-and-swap on [`Job::version`];
//! [`modify_job`] wraps it in a load-apply-retry loop and is the single
//! serialization point for concurrent writers of the same job.

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryJobStore;
pub use schema::SCHEMA_VERSION;
pub use sqlite::SqliteJobStore;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::job::{Job, JobId};

/// Conflicting update attempts tolerated by [`modify_job`]
pub const MAX_UPDATE_ATTEMPTS: u32 = 32;

/// Persistent storage for job aggregates
pub trait JobStore: Send + Sync {
    /// Store a new job
    fn persist(&self, job: &Job) -> StoreResult<Job>;

    /// Replace a stored job if its version still matches `job.version`.
    ///
    /// Returns the stored job with its version bumped. A stale version fails
    /// with [`StoreError::VersionConflict`].
    fn update(&self, job: &Job) -> StoreResult<Job>;

    /// Load a job
    fn get(&self, job_id: &JobId) -> StoreResult<Job>;

    /// Load every job in NOT_STARTED or IN_PROGRESS
    fn get_incomplete(&self) -> StoreResult<Vec<Job>>;

    /// Load every job
    fn get_all(&self) -> StoreResult<Vec<Job>>;

    /// Load jobs created within `[start, end]`, oldest first
    fn get_by_date_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<Vec<Job>>;
}

/// Apply `f` to the current state of a job and store the result.
///
/// `f` returns `None` to leave the job untouched. On a version conflict the
/// job is reloaded and `f` runs again against the fresh state, so `f` must
/// derive its changes from the job it is given.
pub fn modify_job<T, F>(store: &dyn JobStore, job_id: &JobId, mut f: F) -> StoreResult<(Job, Option<T>)>
where
    F: FnMut(&mut Job) -> Option<T>,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let mut job = store.get(job_id)?;
        let Some(value) = f(&mut job) else {
            return Ok((job, None));
        };

        match store.update(&job) {
            Ok(updated) => return Ok((updated, Some(value))),
            Err(e) if e.is_conflict() => {
                tracing::debug!("Job {} update conflict (attempt {}): {}", job_id, attempt, e);
                std::thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }

    tracing::warn!(
        "Job {} still conflicting after {} attempts",
        job_id,
        MAX_UPDATE_ATTEMPTS
    );
    Err(StoreError::Contention {
        job_id: job_id.clone(),
        attempts: MAX_UPDATE_ATTEMPTS,
    })
}

/// Run store work on the blocking pool.
///
/// Store calls block on disk I/O and on other writers' locks, and
/// [`modify_job`] may spin through several conflicting attempts; none of
/// that may run on an async worker thread.
pub async fn run_blocking<T, F>(store: &Arc<dyn JobStore>, f: F) -> StoreResult<T>
where
    F: FnOnce(&dyn JobStore) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ArchiveType, JobState};

    #[test]
    fn test_modify_job_skips_write_on_none() {
        let store = MemoryJobStore::new();
        let job = store.persist(&Job::new(ArchiveType::Zip, 1)).unwrap();

        let (loaded, value) = modify_job::<(), _>(&store, &job.job_id, |_| None).unwrap();
        assert!(value.is_none());
        assert_eq!(loaded.version, job.version);
    }

    #[test]
    fn test_modify_job_bumps_version() {
        let store = MemoryJobStore::new();
        let job = store.persist(&Job::new(ArchiveType::Zip, 1)).unwrap();

        let (updated, value) = modify_job(&store, &job.job_id, |j| {
            j.mark_in_progress();
            Some(j.state)
        })
        .unwrap();
        assert_eq!(value, Some(JobState::InProgress));
        assert_eq!(updated.version, job.version + 1);
        assert_eq!(store.get(&job.job_id).unwrap().state, JobState::InProgress);
    }

    #[test]
    fn test_modify_job_concurrent_increments_are_not_lost() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let job = store.persist(&Job::new(ArchiveType::Zip, 1)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let id = job.job_id.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        modify_job(store.as_ref(), &id, |j| {
                            j.num_files += 1;
                            Some(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stored = store.get(&job.job_id).unwrap();
        assert_eq!(stored.num_files, 200);
        assert_eq!(stored.version, job.version + 200);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_runs_off_the_runtime_thread() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let job = store.persist(&Job::new(ArchiveType::Zip, 1)).unwrap();
        let runtime_thread = std::thread::current().id();

        let id = job.job_id.clone();
        let (updated, thread) = run_blocking(&store, move |store| {
            let (updated, _) = modify_job(store, &id, |j| {
                j.num_files = 7;
                Some(())
            })?;
            Ok((updated, std::thread::current().id()))
        })
        .await
        .unwrap();

        assert_ne!(thread, runtime_thread);
        assert_eq!(updated.num_files, 7);
        assert_eq!(store.get(&job.job_id).unwrap().version, job.version + 1);
    }

    #[test]
    fn test_missing_job() {
        let store = MemoryJobStore::new();
        let err = modify_job(&store, &JobId::generate(), |_| Some(())).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
