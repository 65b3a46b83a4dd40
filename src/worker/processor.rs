//! Archive worker pool
//!
//! Each loop pulls one build request from the dispatch queue, claims the
//! archive in the job store, builds it on the blocking pool, records the
//! outcome and announces it on the completion queue before acknowledging.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::builder::{remove_outputs, ArchiveBuilder, BuildReport};
use crate::config::WorkerConfig;
use crate::error::{BuildError, Result, StoreError, WorkerError};
use crate::job::{Archive, ArchiveState, Job, JobState};
use crate::queue::{ArchiveMessage, Delivery, MessageQueue};
use crate::store::{modify_job, run_blocking, JobStore};

/// Progress information during worker operation
#[derive(Debug, Clone, Default)]
pub struct WorkerProgress {
    /// Archives built
    pub archives_built: u64,
    /// Archives whose build failed
    pub archives_failed: u64,
    /// Messages that needed no build
    pub archives_skipped: u64,
    /// Files written into archives
    pub files_written: u64,
    /// Container bytes written
    pub bytes_written: u64,
    /// Errors encountered
    pub errors: u64,
    /// Archives currently being built
    pub current: Vec<String>,
    /// Elapsed time
    pub elapsed: Duration,
}

/// Final statistics from worker
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total archives built
    pub archives_built: u64,
    /// Total archives whose build failed
    pub archives_failed: u64,
    /// Total messages that needed no build
    pub archives_skipped: u64,
    /// Total files written
    pub files_written: u64,
    /// Total container bytes written
    pub bytes_written: u64,
    /// Total errors
    pub errors: u64,
    /// Total duration
    pub duration: Duration,
}

/// What handling one message amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Archive built and marked COMPLETE
    Built {
        size_bytes: u64,
        files_written: u64,
        files_skipped: u64,
    },
    /// Archive build failed and was marked ERROR
    Failed(String),
    /// Archive was already COMPLETE; only the completion was re-sent
    AlreadyComplete,
    /// Archive already failed this attempt; only the completion was re-sent
    AlreadyFailed,
    /// Nothing to do: job gone or terminal, archive unknown, or message stale
    Skipped(String),
}

#[derive(Default)]
struct Counters {
    built: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    files: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    claimed: AtomicU64,
}

struct WorkerContext {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    dispatch: Arc<dyn MessageQueue>,
    completion: Arc<dyn MessageQueue>,
    shutdown: Arc<AtomicBool>,
    counters: Counters,
    current: RwLock<Vec<String>>,
}

/// Pool of archive build loops
pub struct ArchiveWorker {
    ctx: Arc<WorkerContext>,
}

impl ArchiveWorker {
    /// Create a worker pool reading `dispatch` and announcing on `completion`
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        dispatch: Arc<dyn MessageQueue>,
        completion: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                config,
                store,
                dispatch,
                completion,
                shutdown: Arc::new(AtomicBool::new(false)),
                counters: Counters::default(),
                current: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.ctx.shutdown.store(true, Ordering::SeqCst);
    }

    /// Shared shutdown flag, for signal handlers
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.ctx.shutdown.clone()
    }

    /// Handle one delivery: build the archive it names and announce the
    /// result. The delivery is acknowledged unless the job store failed, in
    /// which case it stays with the queue for redelivery.
    pub async fn process_delivery(&self, consumer: &str, delivery: &Delivery) -> Result<ProcessOutcome> {
        self.ctx.process_delivery(consumer, delivery).await
    }

    /// Run the worker loops until shutdown, the archive limit, or (when not
    /// continuous) an empty dispatch queue
    pub async fn run<F>(&self, progress_callback: F) -> Result<WorkerStats>
    where
        F: Fn(WorkerProgress) + Send + Sync + 'static,
    {
        let start = Instant::now();
        let ctx = &self.ctx;
        let done = Arc::new(AtomicBool::new(false));

        // Spawn progress reporter
        let progress_handle = if ctx.config.show_progress {
            let ctx = ctx.clone();
            let done = done.clone();
            let callback = Arc::new(progress_callback);

            Some(tokio::spawn(async move {
                while !done.load(Ordering::Relaxed) {
                    callback(ctx.progress(start.elapsed()).await);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }))
        } else {
            None
        };

        // Spawn heartbeat task
        let heartbeat_handle = {
            let ctx = ctx.clone();
            let done = done.clone();
            tokio::spawn(async move {
                while !done.load(Ordering::Relaxed) {
                    if let Err(e) = ctx.dispatch.heartbeat(&ctx.config.worker_id).await {
                        warn!("Failed to send heartbeat: {}", e);
                    }
                    tokio::time::sleep(ctx.config.heartbeat_interval).await;
                }
            })
        };

        info!(
            "Worker {} starting {} build loops on {}",
            ctx.config.worker_id, ctx.config.worker_count, ctx.config.host_name
        );

        let loops: Vec<_> = (0..ctx.config.worker_count.max(1))
            .map(|n| {
                let ctx = ctx.clone();
                let consumer = format!("{}-{}", ctx.config.worker_id, n);
                tokio::spawn(async move { ctx.run_loop(consumer).await })
            })
            .collect();

        let mut failure = None;
        for (n, handle) in loops.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!("Build loop {} stopped abnormally: {}", n, e);
                if failure.is_none() {
                    failure = Some(WorkerError::Panicked {
                        id: format!("{}-{}", ctx.config.worker_id, n),
                        message: e.to_string(),
                    });
                }
            }
        }

        done.store(true, Ordering::SeqCst);
        heartbeat_handle.abort();
        if let Some(handle) = progress_handle {
            handle.abort();
        }

        if let Some(e) = failure {
            return Err(e.into());
        }

        let c = &ctx.counters;
        Ok(WorkerStats {
            archives_built: c.built.load(Ordering::Relaxed),
            archives_failed: c.failed.load(Ordering::Relaxed),
            archives_skipped: c.skipped.load(Ordering::Relaxed),
            files_written: c.files.load(Ordering::Relaxed),
            bytes_written: c.bytes.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            duration: start.elapsed(),
        })
    }
}

impl WorkerContext {
    async fn progress(&self, elapsed: Duration) -> WorkerProgress {
        let c = &self.counters;
        WorkerProgress {
            archives_built: c.built.load(Ordering::Relaxed),
            archives_failed: c.failed.load(Ordering::Relaxed),
            archives_skipped: c.skipped.load(Ordering::Relaxed),
            files_written: c.files.load(Ordering::Relaxed),
            bytes_written: c.bytes.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            current: self.current.read().await.clone(),
            elapsed,
        }
    }

    /// Reserve one unit of the archive limit
    fn reserve(&self) -> bool {
        match self.config.max_archives {
            Some(max) => {
                if self.counters.claimed.fetch_add(1, Ordering::SeqCst) >= max {
                    self.counters.claimed.fetch_sub(1, Ordering::SeqCst);
                    false
                } else {
                    true
                }
            }
            None => true,
        }
    }

    fn release(&self) {
        if self.config.max_archives.is_some() {
            self.counters.claimed.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn run_loop(self: Arc<Self>, consumer: String) {
        let timeout = if self.config.continuous {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(1)
        };

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if !self.reserve() {
                debug!("{}: archive limit reached", consumer);
                break;
            }

            match self.dispatch.pop(&consumer, timeout).await {
                Ok(Some(delivery)) => {
                    let label = delivery.message.to_string();
                    self.current.write().await.push(label.clone());

                    if let Err(e) = self.process_delivery(&consumer, &delivery).await {
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                        error!("Failed to process {}: {}", label, e);
                    }

                    self.current.write().await.retain(|c| c != &label);
                }
                Ok(None) => {
                    self.release();
                    if !self.config.continuous {
                        match self.dispatch.is_empty().await {
                            Ok(true) => {
                                info!("{}: dispatch queue is empty, exiting", consumer);
                                break;
                            }
                            Ok(false) => {}
                            Err(e) => warn!("Failed to check queue status: {}", e),
                        }
                    }
                }
                Err(e) => {
                    self.release();
                    error!("Failed to pop build request: {}", e);
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn process_delivery(&self, consumer: &str, delivery: &Delivery) -> Result<ProcessOutcome> {
        let message = &delivery.message;

        let claim = match self.claim(consumer, message).await {
            Ok(claim) => claim,
            Err(StoreError::NotFound { .. }) => {
                warn!("Dropping build request {}: job not found", message);
                self.dispatch.ack(delivery).await?;
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(ProcessOutcome::Skipped("job not found".into()));
            }
            Err(e) => return Err(e.into()),
        };

        let (archive, previous_state) = match claim {
            Claim::Build {
                archive,
                previous_state,
            } => (archive, previous_state),
            Claim::Finished(state) => {
                debug!("Archive {} already {}, re-sending completion", message, state);
                self.completion.push(message).await?;
                self.dispatch.ack(delivery).await?;
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(if state == ArchiveState::Complete {
                    ProcessOutcome::AlreadyComplete
                } else {
                    ProcessOutcome::AlreadyFailed
                });
            }
            Claim::Skip(reason) => {
                warn!("Skipping build request {}: {}", message, reason);
                self.dispatch.ack(delivery).await?;
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(ProcessOutcome::Skipped(reason));
            }
        };

        // A redelivered request for an archive left IN_PROGRESS means the
        // previous consumer died mid-build
        if delivery.redelivered && previous_state == ArchiveState::InProgress {
            match remove_outputs(&archive) {
                Ok(0) => {}
                Ok(n) => info!("Removed {} stale outputs of archive {}", n, message),
                Err(e) => warn!("Failed to remove stale outputs of {}: {}", message, e),
            }
        }

        info!(
            "Building archive {} ({} files, {})",
            message,
            archive.num_files(),
            archive.archive_type
        );
        let result = build_blocking(consumer, archive).await;

        let outcome = match &result {
            Ok(report) => {
                for path in &report.skipped {
                    warn!("Archive {}: left out unreadable {}", message, path.display());
                }
                ProcessOutcome::Built {
                    size_bytes: report.size_bytes,
                    files_written: report.written.len() as u64,
                    files_skipped: report.skipped.len() as u64,
                }
            }
            Err(e) => {
                error!("Archive {} failed: {}", message, e);
                ProcessOutcome::Failed(e.to_string())
            }
        };

        let built = result
            .map(|report| (report.size_bytes, report.written))
            .map_err(|e| e.to_string());
        let msg = message.clone();
        let (job, _) = run_blocking(&self.store, move |store| {
            modify_job(store, &msg.job_id, |job| record_outcome(job, &msg, &built))
        })
        .await?;

        if let Some(current) = job
            .archive(message.archive_id)
            .filter(|a| message.is_superseded_by(a))
        {
            warn!(
                "Archive {} was reset to attempt {} during the build, result dropped",
                message, current.attempt
            );
            self.dispatch.ack(delivery).await?;
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(ProcessOutcome::Skipped(format!(
                "superseded by attempt {}",
                current.attempt
            )));
        }

        // Completion goes out only after the terminal state is stored
        self.completion.push(message).await?;
        self.dispatch.ack(delivery).await?;

        match &outcome {
            ProcessOutcome::Built {
                size_bytes,
                files_written,
                ..
            } => {
                self.counters.built.fetch_add(1, Ordering::Relaxed);
                self.counters.files.fetch_add(*files_written, Ordering::Relaxed);
                self.counters.bytes.fetch_add(*size_bytes, Ordering::Relaxed);
            }
            _ => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(outcome)
    }

    /// Mark the archive IN_PROGRESS for this consumer
    async fn claim(&self, consumer: &str, message: &ArchiveMessage) -> std::result::Result<Claim, StoreError> {
        let host = self.config.host_name.clone();
        let worker = consumer.to_string();
        let msg = message.clone();
        let (job, claimed) = run_blocking(&self.store, move |store| {
            modify_job(store, &msg.job_id, |job| {
                if job.state.is_terminal() {
                    return None;
                }
                let archive = job.archive_mut(msg.archive_id)?;
                if msg.is_superseded_by(archive)
                    || matches!(archive.state, ArchiveState::Complete | ArchiveState::Error)
                {
                    return None;
                }
                let previous_state = archive.state;
                archive.mark_in_progress(&host, &worker);
                let snapshot = archive.clone();
                if job.state == JobState::NotStarted {
                    job.mark_in_progress();
                }
                Some((snapshot, previous_state))
            })
        })
        .await?;

        if let Some((archive, previous_state)) = claimed {
            return Ok(Claim::Build {
                archive: Box::new(archive),
                previous_state,
            });
        }

        Ok(match job.archive(message.archive_id) {
            None => Claim::Skip(
                WorkerError::ArchiveNotFound {
                    job_id: message.job_id.clone(),
                    archive_id: message.archive_id,
                }
                .to_string(),
            ),
            Some(archive) if message.is_superseded_by(archive) => {
                Claim::Skip(format!("superseded by attempt {}", archive.attempt))
            }
            Some(archive) if matches!(archive.state, ArchiveState::Complete | ArchiveState::Error) => {
                Claim::Finished(archive.state)
            }
            Some(_) => Claim::Skip(format!("job is {}", job.state)),
        })
    }
}

enum Claim {
    Build {
        archive: Box<Archive>,
        previous_state: ArchiveState,
    },
    /// This attempt already reached a terminal state
    Finished(ArchiveState),
    Skip(String),
}

/// Store the build result on the archive, unless the archive was reset to a
/// newer attempt meanwhile.
///
/// An archive already forced COMPLETE by a completion still takes the file
/// states of a successful build; a failed build leaves it COMPLETE.
fn record_outcome(
    job: &mut Job,
    message: &ArchiveMessage,
    built: &std::result::Result<(u64, Vec<usize>), String>,
) -> Option<()> {
    let archive = job.archive_mut(message.archive_id)?;
    if message.is_superseded_by(archive) {
        return None;
    }
    match built {
        Ok((size_bytes, written)) => archive.mark_complete(*size_bytes, written),
        Err(_) if archive.is_complete() => return None,
        Err(reason) => archive.mark_error(reason),
    }
    if job.state == JobState::Complete {
        job.recompute_rollups();
    }
    Some(())
}

async fn build_blocking(consumer: &str, archive: Box<Archive>) -> std::result::Result<BuildReport, BuildError> {
    let builder = ArchiveBuilder::new(consumer);
    tokio::task::spawn_blocking(move || builder.build(&archive))
        .await
        .map_err(|e| BuildError::TaskFailed(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ArchiveType, FileEntry, Job, JobId};
    use crate::queue::MemoryQueue;
    use crate::store::MemoryJobStore;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryJobStore>,
        dispatch: Arc<MemoryQueue>,
        completion: Arc<MemoryQueue>,
        worker: ArchiveWorker,
        job_id: JobId,
    }

    fn fixture(archive_type: ArchiveType, archives: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let dispatch = Arc::new(MemoryQueue::new("dispatch"));
        let completion = Arc::new(MemoryQueue::new("completion"));

        let mut job = Job::new(archive_type, 1024 * 1024);
        for id in 0..archives {
            let src = dir.path().join(format!("file{}.txt", id));
            fs::write(&src, format!("contents of file {}", id)).unwrap();

            let mut archive = Archive::new(job.job_id.clone(), id, archive_type);
            archive.add_file(FileEntry::new(src, format!("data/file{}.txt", id), 18));
            archive.output_path = dir
                .path()
                .join("out")
                .join(format!("a_{}.{}", id, archive_type.extension()));
            archive.hash_path = dir.path().join("out").join(format!("a_{}.sha256", id));
            job.archives.push(archive);
        }
        job.num_archives = archives;
        job.num_files = archives as u64;
        job.total_size_bytes = archives as u64 * 18;
        job.mark_in_progress();
        store.persist(&job).unwrap();

        let config = WorkerConfig {
            host_name: "node-a".into(),
            worker_id: "node-a-test".into(),
            worker_count: 2,
            ..Default::default()
        };
        let worker = ArchiveWorker::new(config, store.clone(), dispatch.clone(), completion.clone());

        Fixture {
            _dir: dir,
            store,
            dispatch,
            completion,
            worker,
            job_id: job.job_id,
        }
    }

    async fn deliver(f: &Fixture, archive_id: u32) -> Delivery {
        f.dispatch
            .push(&ArchiveMessage::new(f.job_id.clone(), archive_id))
            .await
            .unwrap();
        f.dispatch
            .pop("test", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_process_builds_and_announces() {
        let f = fixture(ArchiveType::Zip, 1);
        let delivery = deliver(&f, 0).await;

        let outcome = f.worker.process_delivery("c0", &delivery).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Built { files_written: 1, .. }));

        let job = f.store.get(&f.job_id).unwrap();
        let archive = &job.archives[0];
        assert_eq!(archive.state, ArchiveState::Complete);
        assert_eq!(archive.host_name.as_deref(), Some("node-a"));
        assert_eq!(archive.worker_id.as_deref(), Some("c0"));
        assert!(archive.size_bytes > 0);
        assert!(archive.end_time.is_some());
        assert!(archive.output_path.exists());
        assert!(archive.hash_path.exists());
        assert_eq!(archive.num_files_complete(), 1);

        assert_eq!(f.completion.snapshot(), vec![delivery.message.clone()]);
        assert_eq!(f.dispatch.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_unwritable_destination_marks_error() {
        let f = fixture(ArchiveType::Tar, 1);
        modify_job(f.store.as_ref(), &f.job_id, |job| {
            // A regular file where the output directory should be
            let blocker = job.archives[0].hash_path.parent()?.with_file_name("blocker");
            fs::write(&blocker, b"x").ok()?;
            job.archives[0].output_path = blocker.join("a_0.tar");
            Some(())
        })
        .unwrap();

        let delivery = deliver(&f, 0).await;
        let outcome = f.worker.process_delivery("c0", &delivery).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed(_)));

        let job = f.store.get(&f.job_id).unwrap();
        assert_eq!(job.archives[0].state, ArchiveState::Error);
        assert!(job.archives[0].error_message.is_some());
        assert_eq!(f.completion.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_of_complete_archive_skips_build() {
        let f = fixture(ArchiveType::Zip, 1);
        let first = deliver(&f, 0).await;
        f.worker.process_delivery("c0", &first).await.unwrap();
        let built = f.store.get(&f.job_id).unwrap().archives[0].clone();

        let second = deliver(&f, 0).await;
        let outcome = f.worker.process_delivery("c1", &second).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::AlreadyComplete);

        let after = f.store.get(&f.job_id).unwrap().archives[0].clone();
        assert_eq!(after.worker_id, built.worker_id);
        assert_eq!(after.end_time, built.end_time);
        assert_eq!(f.completion.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_redelivery_of_failed_archive_is_not_rebuilt() {
        let f = fixture(ArchiveType::Zip, 1);
        modify_job(f.store.as_ref(), &f.job_id, |job| {
            job.archives[0].mark_error("disk full");
            Some(())
        })
        .unwrap();

        let delivery = deliver(&f, 0).await;
        let outcome = f.worker.process_delivery("c0", &delivery).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::AlreadyFailed);

        let archive = f.store.get(&f.job_id).unwrap().archives[0].clone();
        assert_eq!(archive.state, ArchiveState::Error);
        assert!(!archive.output_path.exists());
        assert_eq!(f.completion.snapshot(), vec![delivery.message.clone()]);
        assert_eq!(f.dispatch.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_request_from_before_a_retry_is_skipped() {
        let f = fixture(ArchiveType::Zip, 1);
        let stale = deliver(&f, 0).await;
        modify_job(f.store.as_ref(), &f.job_id, |job| {
            job.archives[0].mark_error("disk full");
            job.archives[0].reset_for_retry();
            Some(())
        })
        .unwrap();

        let outcome = f.worker.process_delivery("c0", &stale).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Skipped(_)));
        let archive = f.store.get(&f.job_id).unwrap().archives[0].clone();
        assert_eq!(archive.state, ArchiveState::NotStarted);
        assert!(f.completion.snapshot().is_empty());

        // The request for the current attempt builds
        f.dispatch
            .push(&ArchiveMessage::for_archive(&archive))
            .await
            .unwrap();
        let current = f
            .dispatch
            .pop("test", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let outcome = f.worker.process_delivery("c0", &current).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Built { .. }));
        assert_eq!(f.completion.snapshot(), vec![current.message.clone()]);
    }

    #[test]
    fn test_build_result_fills_in_forced_complete_archive() {
        let mut job = Job::new(ArchiveType::Zip, 1024);
        let mut archive = Archive::new(job.job_id.clone(), 0, ArchiveType::Zip);
        archive.add_file(FileEntry::new("/src/a".into(), "a".into(), 10));
        archive.add_file(FileEntry::new("/src/b".into(), "b".into(), 20));
        archive.state = ArchiveState::Complete;
        job.archives.push(archive);
        job.num_archives = 1;
        job.num_files = 2;
        job.total_size_bytes = 30;
        job.recompute_rollups();
        job.mark_complete();
        assert_eq!(job.num_files_complete, 0);

        let message = ArchiveMessage::new(job.job_id.clone(), 0);
        assert!(record_outcome(&mut job, &message, &Ok((64, vec![0, 1]))).is_some());
        assert_eq!(job.archives[0].num_files_complete(), 2);
        assert_eq!(job.archives[0].size_bytes, 64);
        assert_eq!(job.num_files_complete, 2);
        assert_eq!(job.total_size_complete_bytes, 30);

        // A failure never downgrades it
        assert!(record_outcome(&mut job, &message, &Err("late failure".into())).is_none());
        assert_eq!(job.archives[0].state, ArchiveState::Complete);

        // Nor does anything land on a newer attempt
        job.archives[0].reset_for_retry();
        assert!(record_outcome(&mut job, &message, &Ok((64, vec![0, 1]))).is_none());
        assert_eq!(job.archives[0].state, ArchiveState::NotStarted);
    }

    #[tokio::test]
    async fn test_unknown_archive_and_terminal_job_are_skipped() {
        let f = fixture(ArchiveType::Zip, 1);
        let delivery = deliver(&f, 9).await;
        let outcome = f.worker.process_delivery("c0", &delivery).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Skipped(_)));

        modify_job(f.store.as_ref(), &f.job_id, |job| {
            job.mark_error();
            Some(())
        })
        .unwrap();
        let delivery = deliver(&f, 0).await;
        let outcome = f.worker.process_delivery("c0", &delivery).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Skipped(_)));

        let job = f.store.get(&f.job_id).unwrap();
        assert_eq!(job.state, JobState::Error);
        assert_eq!(job.archives[0].state, ArchiveState::NotStarted);
        assert!(f.completion.snapshot().is_empty());
        assert_eq!(f.dispatch.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_exits() {
        let f = fixture(ArchiveType::Gzip, 4);
        for id in 0..4 {
            f.dispatch
                .push(&ArchiveMessage::new(f.job_id.clone(), id))
                .await
                .unwrap();
        }

        let stats = f.worker.run(|_| {}).await.unwrap();
        assert_eq!(stats.archives_built, 4);
        assert_eq!(stats.files_written, 4);
        assert_eq!(stats.errors, 0);

        let job = f.store.get(&f.job_id).unwrap();
        assert!(job.all_archives_complete());
        assert_eq!(f.completion.snapshot().len(), 4);
    }

    #[tokio::test]
    async fn test_run_honours_archive_limit() {
        let mut f = fixture(ArchiveType::Zip, 3);
        for id in 0..3 {
            f.dispatch
                .push(&ArchiveMessage::new(f.job_id.clone(), id))
                .await
                .unwrap();
        }
        f.worker = ArchiveWorker::new(
            WorkerConfig {
                host_name: "node-a".into(),
                worker_id: "node-a-limit".into(),
                worker_count: 1,
                max_archives: Some(2),
                ..Default::default()
            },
            f.store.clone(),
            f.dispatch.clone(),
            f.completion.clone(),
        );

        let stats = f.worker.run(|_| {}).await.unwrap();
        assert_eq!(stats.archives_built, 2);
        assert_eq!(f.dispatch.pending_count().await.unwrap(), 1);
    }
}
