//! Completion handling

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError, StoreResult};
use crate::job::{ArchiveState, JobState};
use crate::queue::{ArchiveMessage, MessageQueue};
use crate::store::{modify_job, run_blocking, JobStore};

/// Effect of one completion message on its job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOutcome {
    /// Rollups moved; the job is still running
    Progress {
        archives_complete: u32,
        num_archives: u32,
    },
    /// This completion finished the job
    JobComplete,
    /// Nothing changed: duplicate, stale or errored archive, or terminal job
    Unchanged,
    /// The job or the archive does not exist
    Unknown,
}

/// Final statistics from an aggregator run
#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    /// Completion messages handled
    pub completions: u64,
    /// Jobs moved to COMPLETE
    pub jobs_completed: u64,
    /// Messages naming unknown jobs or archives
    pub unknown: u64,
    /// Errors encountered
    pub errors: u64,
    /// Total duration
    pub duration: Duration,
}

/// Folds archive completions into job rollups
pub struct JobAggregator {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn MessageQueue>,
    shutdown: AtomicBool,
    finishing: AtomicBool,
}

impl JobAggregator {
    /// Create an aggregator consuming `queue`
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            store,
            queue,
            shutdown: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
        }
    }

    /// Stop after the message in hand
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Stop once the completion queue is empty
    pub fn finish(&self) {
        self.finishing.store(true, Ordering::SeqCst);
    }

    /// Apply one completion message to its job
    pub fn handle_completion(&self, message: &ArchiveMessage) -> Result<AggregateOutcome> {
        Ok(apply_completion(self.store.as_ref(), message)?)
    }

    /// Consume the completion queue until shutdown, or until it is empty
    /// after [`finish`](Self::finish) was called
    pub async fn run(&self, consumer: &str) -> Result<AggregatorStats> {
        let start = Instant::now();
        let mut stats = AggregatorStats::default();

        while !self.shutdown.load(Ordering::Relaxed) {
            let delivery = match self.queue.pop(consumer, Duration::from_secs(1)).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    if self.finishing.load(Ordering::Relaxed) {
                        match self.queue.is_empty().await {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(e) => warn!("Failed to check completion queue: {}", e),
                        }
                    }
                    continue;
                }
                Err(e) => {
                    error!("Failed to pop completion: {}", e);
                    stats.errors += 1;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let message = delivery.message.clone();
            let applied = run_blocking(&self.store, move |store| apply_completion(store, &message)).await;
            match applied {
                Ok(outcome) => {
                    stats.completions += 1;
                    match outcome {
                        AggregateOutcome::JobComplete => stats.jobs_completed += 1,
                        AggregateOutcome::Unknown => stats.unknown += 1,
                        _ => {}
                    }
                    if let Err(e) = self.queue.ack(&delivery).await {
                        error!("Failed to ack completion {}: {}", delivery.message, e);
                        stats.errors += 1;
                    }
                }
                Err(e) => {
                    // Left unacknowledged for redelivery
                    error!("Failed to apply completion {}: {}", delivery.message, e);
                    stats.errors += 1;
                }
            }
        }

        stats.duration = start.elapsed();
        Ok(stats)
    }
}

/// Apply one completion message to the job store.
///
/// A completion stamped with an older attempt than the archive's is stale:
/// the archive was reset and re-dispatched after it was sent, and it is
/// ignored. A current completion for an archive still IN_PROGRESS forces
/// it to COMPLETE; NOT_STARTED and ERROR archives are left as they are.
/// Rollups are recomputed from the archives and the job becomes COMPLETE
/// once every archive is. All of it happens in one versioned update, so
/// concurrent completions for the same job never overwrite each other.
fn apply_completion(store: &dyn JobStore, message: &ArchiveMessage) -> StoreResult<AggregateOutcome> {
    let result = modify_job(store, &message.job_id, |job| {
        if job.state.is_terminal() {
            return None;
        }

        let archive = job.archive_mut(message.archive_id)?;
        if message.is_superseded_by(archive) {
            return None;
        }
        if archive.state == ArchiveState::InProgress {
            warn!(
                "Archive {} is {} at completion, forcing COMPLETE",
                message, archive.state
            );
            archive.state = ArchiveState::Complete;
            archive.end_time.get_or_insert_with(Utc::now);
        }

        let before = (
            job.num_archives_complete,
            job.num_files_complete,
            job.total_size_complete_bytes,
        );
        let report = job.recompute_rollups();
        if !report.is_consistent() {
            warn!("Job {} rollups corrected: {:?}", job.job_id, report);
        }

        if job.num_archives > 0 && job.num_archives_complete == job.num_archives {
            job.mark_complete();
            return Some(AggregateOutcome::JobComplete);
        }

        let after = (
            job.num_archives_complete,
            job.num_files_complete,
            job.total_size_complete_bytes,
        );
        if before == after && job.state == JobState::InProgress {
            return None;
        }
        if job.state == JobState::NotStarted {
            job.mark_in_progress();
        }
        Some(AggregateOutcome::Progress {
            archives_complete: job.num_archives_complete,
            num_archives: job.num_archives,
        })
    });

    let (job, outcome) = match result {
        Ok(r) => r,
        Err(StoreError::NotFound { .. }) => {
            warn!("Completion {} names an unknown job", message);
            return Ok(AggregateOutcome::Unknown);
        }
        Err(e) => return Err(e),
    };

    match (outcome, job.archive(message.archive_id)) {
        (Some(AggregateOutcome::JobComplete), _) => {
            info!(
                "Job {} complete: {} archives, {}/{} files",
                job.job_id, job.num_archives, job.num_files_complete, job.num_files
            );
            Ok(AggregateOutcome::JobComplete)
        }
        (Some(outcome), _) => {
            debug!(
                "Job {}: {}/{} archives complete",
                job.job_id, job.num_archives_complete, job.num_archives
            );
            Ok(outcome)
        }
        (None, None) => {
            warn!("Completion {} names an unknown archive", message);
            Ok(AggregateOutcome::Unknown)
        }
        (None, Some(archive)) => {
            if message.is_superseded_by(archive) {
                debug!(
                    "Completion {} superseded by attempt {}, ignored",
                    message, archive.attempt
                );
            }
            Ok(AggregateOutcome::Unchanged)
        }
    }
}
