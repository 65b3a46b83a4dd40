//! Dispatch of archive build requests

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::job::{JobId, JobState};
use crate::queue::{ArchiveMessage, MessageQueue};
use crate::store::{modify_job, run_blocking, JobStore};

/// Enqueues one build message per archive of a job
#[derive(Clone)]
pub struct WorkDispatcher {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn MessageQueue>,
}

impl WorkDispatcher {
    /// Create a dispatcher writing to `queue`
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn MessageQueue>) -> Self {
        Self { store, queue }
    }

    /// Start a job: move it to IN_PROGRESS and enqueue every archive that is
    /// not complete yet. Returns the dispatched archive ids.
    ///
    /// Jobs without archives and jobs in a terminal state are left alone.
    pub async fn dispatch(&self, job_id: &JobId) -> Result<Vec<u32>> {
        let id = job_id.clone();
        let (job, pending) = run_blocking(&self.store, move |store| {
            modify_job(store, &id, |job| {
                if job.archives.is_empty() || job.state.is_terminal() {
                    return None;
                }
                if job.state == JobState::NotStarted {
                    job.mark_in_progress();
                }
                Some(
                    job.archives
                        .iter()
                        .filter(|a| !a.is_complete())
                        .map(ArchiveMessage::for_archive)
                        .collect::<Vec<_>>(),
                )
            })
        })
        .await?;

        let Some(messages) = pending else {
            debug!(
                "Job {} not dispatched (state {}, {} archives)",
                job_id,
                job.state,
                job.archives.len()
            );
            return Ok(Vec::new());
        };

        self.enqueue(job_id, &messages).await?;
        info!("Dispatched {} archives of job {}", messages.len(), job_id);
        Ok(messages.iter().map(|m| m.archive_id).collect())
    }

    /// Enqueue the given archives again at their current attempt, without
    /// touching job state
    pub async fn redispatch(&self, job_id: &JobId, archive_ids: &[u32]) -> Result<usize> {
        if archive_ids.is_empty() {
            return Ok(0);
        }
        let id = job_id.clone();
        let job = run_blocking(&self.store, move |store| store.get(&id)).await?;
        let messages: Vec<ArchiveMessage> = archive_ids
            .iter()
            .filter_map(|&archive_id| job.archive(archive_id))
            .map(ArchiveMessage::for_archive)
            .collect();

        self.enqueue(job_id, &messages).await?;
        info!("Re-dispatched {} archives of job {}", messages.len(), job_id);
        Ok(messages.len())
    }

    async fn enqueue(&self, job_id: &JobId, messages: &[ArchiveMessage]) -> Result<()> {
        for message in messages {
            self.queue.push(message).await?;
        }

        // Recorded after the push so a crash in between leaves the archive
        // looking undispatched to recovery
        let id = job_id.clone();
        let sent = messages.to_vec();
        run_blocking(&self.store, move |store| {
            modify_job(store, &id, |job| {
                let mut changed = false;
                for message in &sent {
                    if let Some(archive) = job.archive_mut(message.archive_id) {
                        if !archive.is_complete() && !message.is_superseded_by(archive) {
                            archive.mark_dispatched();
                            changed = true;
                        }
                    }
                }
                changed.then_some(())
            })
        })
        .await?;

        Ok(())
    }
}
