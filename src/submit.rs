//! Job submission
//!
//! Turns a validated request into a partitioned, persisted and dispatched job.

use std::sync::Arc;
use tracing::info;

use crate::error::{RequestError, Result};
use crate::job::{ArchiveType, Job};
use crate::partition::{ArchivePartitioner, ValidatedFile};
use crate::store::{run_blocking, JobStore};
use crate::worker::WorkDispatcher;

/// A client request naming the files to bundle
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    /// Requesting user
    pub user_name: String,
    /// Requested archive type, resolved leniently
    pub archive_type: String,
    /// Requested target size in MB; the configured default when absent
    pub target_size_mb: Option<u64>,
    /// Files that passed validation
    pub files: Vec<ValidatedFile>,
}

/// Accepts requests on this node
pub struct JobSubmitter {
    partitioner: ArchivePartitioner,
    store: Arc<dyn JobStore>,
    dispatcher: WorkDispatcher,
    host_name: String,
}

impl JobSubmitter {
    /// Create a submitter stamping jobs with `host_name`
    pub fn new(
        partitioner: ArchivePartitioner,
        store: Arc<dyn JobStore>,
        dispatcher: WorkDispatcher,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            partitioner,
            store,
            dispatcher,
            host_name: host_name.into(),
        }
    }

    /// Partition, persist and dispatch a request. Returns the stored job.
    ///
    /// The job is persisted before any message is queued. A crash between
    /// the two leaves undispatched archives that recovery on this node picks
    /// up.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Job> {
        if request.files.is_empty() {
            return Err(RequestError::NoFiles.into());
        }

        let archive_type = ArchiveType::parse_or_default(&request.archive_type);
        let target_mb = self
            .partitioner
            .config()
            .clamp_target_mb(request.target_size_mb);

        let mut job = self
            .partitioner
            .partition(&request.files, target_mb, archive_type);
        job.user_name = request.user_name;
        job.origin_host = Some(self.host_name.clone());

        let job = run_blocking(&self.store, move |store| store.persist(&job)).await?;
        info!(
            "Accepted job {}: {} files in {} {} archives",
            job.job_id, job.num_files, job.num_archives, job.archive_type
        );

        self.dispatcher.dispatch(&job.job_id).await?;
        let job_id = job.job_id;
        Ok(run_blocking(&self.store, move |store| store.get(&job_id)).await?)
    }
}
