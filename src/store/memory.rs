//! In-process job store

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{StoreError, StoreResult};
use crate::job::{Job, JobId};
use crate::store::JobStore;

/// Job store backed by a map, for single-process deployments and tests
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    fn collect<P>(&self, mut predicate: P) -> Vec<Job>
    where
        P: FnMut(&Job) -> bool,
    {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|j| predicate(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.job_id.cmp(&b.job_id)));
        jobs
    }
}

impl JobStore for MemoryJobStore {
    fn persist(&self, job: &Job) -> StoreResult<Job> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::AlreadyExists {
                job_id: job.job_id.clone(),
            });
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(job.clone())
    }

    fn update(&self, job: &Job) -> StoreResult<Job> {
        let mut jobs = self.jobs.write();
        let stored = jobs.get_mut(&job.job_id).ok_or_else(|| StoreError::NotFound {
            job_id: job.job_id.clone(),
        })?;

        if stored.version != job.version {
            return Err(StoreError::VersionConflict {
                job_id: job.job_id.clone(),
                expected: job.version,
                found: stored.version,
            });
        }

        let mut updated = job.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        self.jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                job_id: job_id.clone(),
            })
    }

    fn get_incomplete(&self) -> StoreResult<Vec<Job>> {
        Ok(self.collect(|j| j.is_incomplete()))
    }

    fn get_all(&self) -> StoreResult<Vec<Job>> {
        Ok(self.collect(|_| true))
    }

    fn get_by_date_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        Ok(self.collect(|j| j.created_at >= start && j.created_at <= end))
    }
}
