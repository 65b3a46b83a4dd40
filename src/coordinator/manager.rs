//! Coordinator for system-wide monitoring and operator actions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::builder::remove_outputs;
use crate::error::{Result, WorkerError};
use crate::job::{ArchiveState, Job, JobId, JobState};
use crate::queue::{MessageQueue, QueueStats, WorkerHeartbeat};
use crate::store::{modify_job, run_blocking, JobStore};
use crate::worker::WorkDispatcher;

/// Information about a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Worker ID
    pub id: String,
    /// Last heartbeat time
    pub last_heartbeat: DateTime<Utc>,
    /// Whether worker is considered alive
    pub is_alive: bool,
    /// Time since last heartbeat (seconds)
    pub seconds_since_heartbeat: i64,
}

impl WorkerInfo {
    fn from_heartbeat(heartbeat: WorkerHeartbeat, now: DateTime<Utc>, timeout: Duration) -> Self {
        let seconds_since = (now - heartbeat.last_seen).num_seconds();
        Self {
            id: heartbeat.worker_id,
            last_heartbeat: heartbeat.last_seen,
            is_alive: seconds_since < timeout.as_secs() as i64,
            seconds_since_heartbeat: seconds_since,
        }
    }
}

/// Job counts by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub not_started: u64,
    pub in_progress: u64,
    pub complete: u64,
    pub error: u64,
    pub invalid_request: u64,
    /// Archives parked in ERROR across all jobs
    pub archives_in_error: u64,
}

impl JobCounts {
    /// Tally a list of jobs
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            match job.state {
                JobState::NotStarted => counts.not_started += 1,
                JobState::InProgress => counts.in_progress += 1,
                JobState::Complete => counts.complete += 1,
                JobState::Error => counts.error += 1,
                JobState::InvalidRequest => counts.invalid_request += 1,
            }
            counts.archives_in_error += job
                .archives
                .iter()
                .filter(|a| a.state == ArchiveState::Error)
                .count() as u64;
        }
        counts
    }

    /// Jobs still expected to make progress
    pub fn active(&self) -> u64 {
        self.not_started + self.in_progress
    }
}

/// System-wide status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Jobs by state
    pub jobs: JobCounts,
    /// Dispatch queue statistics
    pub dispatch: QueueStats,
    /// Completion queue statistics
    pub completion: QueueStats,
    /// Known workers
    pub workers: Vec<WorkerInfo>,
    /// System health (idle, healthy, degraded, critical)
    pub health: String,
    /// Timestamp of this status
    pub timestamp: DateTime<Utc>,
    /// Messages/warnings
    pub messages: Vec<String>,
}

/// Operator view over the job store and queues
pub struct Coordinator {
    store: Arc<dyn JobStore>,
    dispatch: Arc<dyn MessageQueue>,
    completion: Arc<dyn MessageQueue>,
    dispatcher: WorkDispatcher,
    heartbeat_timeout: Duration,
}

impl Coordinator {
    /// Create a coordinator
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatch: Arc<dyn MessageQueue>,
        completion: Arc<dyn MessageQueue>,
        heartbeat_timeout: Duration,
    ) -> Self {
        let dispatcher = WorkDispatcher::new(store.clone(), dispatch.clone());
        Self {
            store,
            dispatch,
            completion,
            dispatcher,
            heartbeat_timeout,
        }
    }

    /// Get system status
    pub async fn status(&self) -> Result<SystemStatus> {
        let jobs = JobCounts::from_jobs(&run_blocking(&self.store, |store| store.get_all()).await?);
        let dispatch = self.dispatch.stats().await?;
        let completion = self.completion.stats().await?;

        let now = Utc::now();
        let workers: Vec<WorkerInfo> = self
            .dispatch
            .workers()
            .await?
            .into_iter()
            .map(|hb| WorkerInfo::from_heartbeat(hb, now, self.heartbeat_timeout))
            .collect();

        let health = determine_health(&jobs, &dispatch, &workers).to_string();

        let mut messages = Vec::new();
        if jobs.archives_in_error > 0 {
            messages.push(format!(
                "{} archives are in ERROR - consider retrying with 'archive-bundler retry <JOB_ID>'",
                jobs.archives_in_error
            ));
        }
        if workers.iter().all(|w| !w.is_alive) && dispatch.pending > 0 {
            messages.push(
                "No active workers but archives are pending - start workers to build them"
                    .to_string(),
            );
        }
        let dead_workers = workers.iter().filter(|w| !w.is_alive).count();
        if dead_workers > 0 {
            messages.push(format!(
                "{} workers have stopped responding (may be stalled or crashed)",
                dead_workers
            ));
        }
        if completion.pending > 0 && dispatch.pending == 0 && dispatch.processing == 0 {
            messages.push(format!(
                "{} completions are waiting for an aggregator",
                completion.pending
            ));
        }

        Ok(SystemStatus {
            jobs,
            dispatch,
            completion,
            workers,
            health,
            timestamp: now,
            messages,
        })
    }

    /// Retry archives in ERROR: remove their partial output, reset them with
    /// a fresh retry budget and dispatch them again. A job parked in ERROR
    /// returns to IN_PROGRESS. Returns the re-dispatched archive ids.
    pub async fn retry_archives(&self, job_id: &JobId, archive_id: Option<u32>) -> Result<Vec<u32>> {
        let id = job_id.clone();
        let job = run_blocking(&self.store, move |store| store.get(&id)).await?;
        if let Some(id) = archive_id {
            if job.archive(id).is_none() {
                return Err(WorkerError::ArchiveNotFound {
                    job_id: job_id.clone(),
                    archive_id: id,
                }
                .into());
            }
        }

        let selected = move |state: ArchiveState, id: u32| {
            state == ArchiveState::Error && archive_id.map_or(true, |want| want == id)
        };

        for archive in job.archives.iter().filter(|a| selected(a.state, a.archive_id)) {
            if let Err(e) = remove_outputs(archive) {
                warn!(
                    "Failed to remove outputs of {}/{}: {}",
                    job_id, archive.archive_id, e
                );
            }
        }

        let id = job_id.clone();
        let (_, retried) = run_blocking(&self.store, move |store| {
            modify_job(store, &id, |job| {
                if matches!(job.state, JobState::Complete | JobState::InvalidRequest) {
                    return None;
                }
                let mut ids = Vec::new();
                for archive in job.archives.iter_mut() {
                    if selected(archive.state, archive.archive_id) {
                        archive.reset_for_retry();
                        archive.retry_count = 0;
                        ids.push(archive.archive_id);
                    }
                }
                if ids.is_empty() {
                    return None;
                }
                job.mark_in_progress();
                Some(ids)
            })
        })
        .await?;

        let ids = retried.unwrap_or_default();
        if ids.is_empty() {
            info!("Job {} has no archives in ERROR to retry", job_id);
            return Ok(ids);
        }
        self.dispatcher.redispatch(job_id, &ids).await?;
        Ok(ids)
    }
}

/// Determine system health
fn determine_health(jobs: &JobCounts, dispatch: &QueueStats, workers: &[WorkerInfo]) -> &'static str {
    let alive_workers = workers.iter().filter(|w| w.is_alive).count();
    let total_workers = workers.len();

    if jobs.active() == 0 && dispatch.pending == 0 && dispatch.processing == 0 {
        return "idle";
    }

    if alive_workers == 0 && dispatch.pending > 0 {
        return "critical";
    }

    if jobs.error > jobs.complete / 10 {
        return "degraded";
    }

    if alive_workers < total_workers / 2 {
        return "degraded";
    }

    "healthy"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Archive, ArchiveType};
    use crate::queue::{ArchiveMessage, MemoryQueue};
    use crate::store::MemoryJobStore;

    fn worker(alive: bool) -> WorkerInfo {
        WorkerInfo {
            id: "worker-1".to_string(),
            last_heartbeat: Utc::now(),
            is_alive: alive,
            seconds_since_heartbeat: if alive { 5 } else { 500 },
        }
    }

    fn coordinator() -> (Arc<MemoryJobStore>, Arc<MemoryQueue>, Coordinator) {
        let store = Arc::new(MemoryJobStore::new());
        let dispatch = Arc::new(MemoryQueue::new("dispatch"));
        let completion = Arc::new(MemoryQueue::new("completion"));
        let coordinator = Coordinator::new(
            store.clone(),
            dispatch.clone(),
            completion,
            Duration::from_secs(60),
        );
        (store, dispatch, coordinator)
    }

    #[test]
    fn test_health() {
        let idle = JobCounts::default();
        assert_eq!(determine_health(&idle, &QueueStats::default(), &[]), "idle");

        let busy = JobCounts {
            in_progress: 1,
            ..Default::default()
        };
        let pending = QueueStats {
            pending: 3,
            ..Default::default()
        };
        assert_eq!(determine_health(&busy, &pending, &[]), "critical");
        assert_eq!(determine_health(&busy, &pending, &[worker(true)]), "healthy");
        assert_eq!(
            determine_health(&busy, &pending, &[worker(true), worker(false), worker(false)]),
            "degraded"
        );
    }

    #[tokio::test]
    async fn test_status_counts_jobs_and_workers() {
        let (store, dispatch, coordinator) = coordinator();
        let mut job = Job::new(ArchiveType::Zip, 1);
        job.archives
            .push(Archive::new(job.job_id.clone(), 0, ArchiveType::Zip));
        job.archives[0].mark_error("disk full");
        job.num_archives = 1;
        job.mark_in_progress();
        store.persist(&job).unwrap();
        store.persist(&Job::new(ArchiveType::Tar, 1)).unwrap();
        dispatch.heartbeat("node-a-1").await.unwrap();

        let status = coordinator.status().await.unwrap();
        assert_eq!(status.jobs.in_progress, 1);
        assert_eq!(status.jobs.not_started, 1);
        assert_eq!(status.jobs.archives_in_error, 1);
        assert_eq!(status.workers.len(), 1);
        assert!(status.workers[0].is_alive);
        assert!(status.messages.iter().any(|m| m.contains("ERROR")));
    }

    #[tokio::test]
    async fn test_retry_archives_resets_and_redispatches() {
        let (store, dispatch, coordinator) = coordinator();
        let mut job = Job::new(ArchiveType::Zip, 1);
        for id in 0..3 {
            job.archives
                .push(Archive::new(job.job_id.clone(), id, ArchiveType::Zip));
        }
        job.archives[0].state = ArchiveState::Complete;
        job.archives[1].mark_error("disk full");
        job.archives[1].retry_count = 3;
        job.archives[2].mark_error("disk full");
        job.num_archives = 3;
        job.mark_error();
        store.persist(&job).unwrap();

        let ids = coordinator.retry_archives(&job.job_id, Some(1)).await.unwrap();
        assert_eq!(ids, vec![1]);
        let stored = store.get(&job.job_id).unwrap();
        assert_eq!(
            dispatch.snapshot(),
            vec![ArchiveMessage::for_archive(&stored.archives[1])]
        );
        assert_eq!(dispatch.snapshot()[0].attempt, 1);

        assert_eq!(stored.state, JobState::InProgress);
        assert_eq!(stored.archives[1].state, ArchiveState::NotStarted);
        assert_eq!(stored.archives[1].retry_count, 0);
        assert_eq!(stored.archives[1].attempt, 1);
        assert_eq!(stored.archives[2].state, ArchiveState::Error);

        let ids = coordinator.retry_archives(&job.job_id, None).await.unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_retry_unknown_archive_fails() {
        let (store, _, coordinator) = coordinator();
        let job = store.persist(&Job::new(ArchiveType::Zip, 1)).unwrap();
        assert!(coordinator.retry_archives(&job.job_id, Some(4)).await.is_err());
        assert!(coordinator
            .retry_archives(&job.job_id, None)
            .await
            .unwrap()
            .is_empty());
    }
}
