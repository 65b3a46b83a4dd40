//! Startup recovery
//!
//! Runs once when a node starts, before its workers, and repairs what a
//! previous crash of this node may have left behind:
//! 1. Jobs that can never progress because they have no archives
//! 2. Jobs whose archives all finished but whose final completion was lost
//! 3. Archives this node claimed (or never dispatched) and did not finish

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::builder::remove_outputs;
use crate::config::RecoveryConfig;
use crate::error::{Result, StoreResult};
use crate::job::{Archive, ArchiveState, Job, JobState};
use crate::store::{modify_job, run_blocking, JobStore};
use crate::worker::WorkDispatcher;

/// Changes made by one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs reclassified INVALID_REQUEST
    pub invalidated: usize,
    /// Jobs forced COMPLETE from their archive states
    pub reconciled: usize,
    /// Archives reset and dispatched again
    pub redispatched: usize,
    /// Archives parked in ERROR after exhausting their retries
    pub abandoned: usize,
    /// Jobs moved to ERROR because every unfinished archive is parked
    pub failed_jobs: usize,
}

impl RecoveryReport {
    /// Whether the pass changed nothing
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Default)]
struct OrphanPlan {
    retry: Vec<u32>,
    abandoned: usize,
    failed: bool,
}

/// Per-node recovery pass
pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    store: Arc<dyn JobStore>,
    dispatcher: WorkDispatcher,
}

impl RecoveryCoordinator {
    /// Create a recovery pass for the node named in `config`
    pub fn new(config: RecoveryConfig, store: Arc<dyn JobStore>, dispatcher: WorkDispatcher) -> Self {
        Self {
            config,
            store,
            dispatcher,
        }
    }

    /// Run the three checks in order
    pub async fn run(&self) -> Result<RecoveryReport> {
        let threshold = self.config.processing_time_threshold;
        let (invalidated, reconciled) = run_blocking(&self.store, move |store| {
            Ok((sweep_invalid(store)?, reconcile_complete(store, threshold)?))
        })
        .await?;

        let mut report = RecoveryReport {
            invalidated,
            reconciled,
            ..Default::default()
        };
        self.retry_orphans(&mut report).await?;

        if report.is_noop() {
            info!("Recovery on {}: nothing to do", self.config.host_name);
        } else {
            info!(
                "Recovery on {}: {} invalid, {} reconciled, {} re-dispatched, {} abandoned, {} failed jobs",
                self.config.host_name,
                report.invalidated,
                report.reconciled,
                report.redispatched,
                report.abandoned,
                report.failed_jobs
            );
        }
        Ok(report)
    }

    /// Reset and re-dispatch this node's unfinished archives
    async fn retry_orphans(&self, report: &mut RecoveryReport) -> Result<()> {
        let host = self.config.host_name.as_str();
        let max_retries = self.config.max_retries;

        for job in run_blocking(&self.store, |store| store.get_incomplete()).await? {
            let orphans: Vec<&Archive> = job
                .archives
                .iter()
                .filter(|a| is_orphan(&job, a, host, max_retries))
                .collect();
            if orphans.is_empty() && !has_only_parked_remaining(&job, max_retries) {
                continue;
            }

            for archive in orphans.iter().filter(|a| a.retry_count < max_retries) {
                warn!(
                    "Archive {}/{} orphaned on {} ({}), cleaning up",
                    job.job_id, archive.archive_id, host, archive.state
                );
                if let Err(e) = remove_outputs(archive) {
                    warn!(
                        "Failed to remove outputs of {}/{}: {}",
                        job.job_id, archive.archive_id, e
                    );
                }
            }
            let cleaned: Vec<u32> = orphans
                .iter()
                .filter(|a| a.retry_count < max_retries)
                .map(|a| a.archive_id)
                .collect();

            let job_id = job.job_id.clone();
            let owner = host.to_string();
            let (_, plan) = run_blocking(&self.store, move |store| {
                modify_job(store, &job_id, |job| {
                    plan_orphans(job, &owner, max_retries, &cleaned)
                })
            })
            .await?;
            let Some(plan) = plan else {
                continue;
            };

            report.abandoned += plan.abandoned;
            if plan.failed {
                warn!("Job {} has archives that exhausted their retries, marked ERROR", job.job_id);
                report.failed_jobs += 1;
            }
            report.redispatched += self
                .dispatcher
                .redispatch(&job.job_id, &plan.retry)
                .await?;
        }
        Ok(())
    }
}

/// NOT_STARTED jobs without archives become INVALID_REQUEST
fn sweep_invalid(store: &dyn JobStore) -> StoreResult<usize> {
    let mut count = 0;
    for job in store.get_incomplete()? {
        if !is_invalid(&job) {
            continue;
        }
        let (_, changed) = modify_job(store, &job.job_id, |job| {
            if !is_invalid(job) {
                return None;
            }
            job.mark_invalid();
            Some(())
        })?;
        if changed.is_some() {
            warn!("Job {} has no archives, marked INVALID_REQUEST", job.job_id);
            count += 1;
        }
    }
    Ok(count)
}

/// Old unfinished jobs whose archives are all COMPLETE become COMPLETE
fn reconcile_complete(store: &dyn JobStore, threshold: Duration) -> StoreResult<usize> {
    let now = Utc::now();
    let mut count = 0;

    for job in store.get_incomplete()? {
        let overdue = job
            .elapsed(now)
            .to_std()
            .map(|elapsed| elapsed > threshold)
            .unwrap_or(false);
        if !overdue || !job.all_archives_complete() {
            continue;
        }

        let (_, changed) = modify_job(store, &job.job_id, |job| {
            if !job.is_incomplete() || !job.all_archives_complete() {
                return None;
            }
            let report = job.recompute_rollups();
            if !report.is_consistent() {
                warn!("Job {} rollups corrected: {:?}", job.job_id, report);
            }
            job.mark_complete();
            Some(())
        })?;
        if changed.is_some() {
            warn!(
                "Job {} had every archive complete but was still {}, marked COMPLETE",
                job.job_id, job.state
            );
            count += 1;
        }
    }
    Ok(count)
}

fn is_invalid(job: &Job) -> bool {
    job.state == JobState::NotStarted && job.num_archives == 0 && job.archives.is_empty()
}

fn is_parked(archive: &Archive, max_retries: u32) -> bool {
    archive.state == ArchiveState::Error && archive.retry_count >= max_retries
}

/// Whether `archive` was left unfinished by `host`
fn is_orphan(job: &Job, archive: &Archive, host: &str, max_retries: u32) -> bool {
    if is_parked(archive, max_retries) {
        return false;
    }
    let owned = archive.host_name.as_deref() == Some(host);
    match archive.state {
        ArchiveState::Complete => false,
        ArchiveState::InProgress | ArchiveState::Error => owned,
        // Never dispatched: crash between persist and dispatch
        ArchiveState::NotStarted => {
            archive.dispatched_at.is_none()
                && (owned
                    || (archive.host_name.is_none() && job.origin_host.as_deref() == Some(host)))
        }
    }
}

fn has_only_parked_remaining(job: &Job, max_retries: u32) -> bool {
    !job.archives.is_empty()
        && job
            .archives
            .iter()
            .all(|a| a.is_complete() || is_parked(a, max_retries))
        && job.archives.iter().any(|a| is_parked(a, max_retries))
}

/// Apply the orphan rules to a fresh copy of the job
fn plan_orphans(job: &mut Job, host: &str, max_retries: u32, cleaned: &[u32]) -> Option<OrphanPlan> {
    let mut plan = OrphanPlan::default();
    let snapshot = job.clone();

    for archive in job.archives.iter_mut() {
        if !is_orphan(&snapshot, archive, host, max_retries) {
            continue;
        }
        if archive.retry_count >= max_retries {
            archive.mark_error(&format!(
                "abandoned after {} recovery retries",
                archive.retry_count
            ));
            plan.abandoned += 1;
        } else if cleaned.contains(&archive.archive_id) {
            archive.reset_for_retry();
            plan.retry.push(archive.archive_id);
        }
    }

    if !plan.retry.is_empty() && job.state == JobState::NotStarted {
        job.mark_in_progress();
    }
    if has_only_parked_remaining(job, max_retries) {
        job.recompute_rollups();
        job.mark_error();
        plan.failed = true;
    }

    if plan.retry.is_empty() && plan.abandoned == 0 && !plan.failed {
        return None;
    }
    Some(plan)
}
