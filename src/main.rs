//! archive-bundler - Distributed archive bundler
//!
//! Partitions file sets into size-bounded archives and builds them across a
//! cluster of worker nodes.

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use console::{style, Term};
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archive_bundler::aggregator::JobAggregator;
use archive_bundler::config::{
    queue_config_from_url, CliArgs, Command, RecoveryConfig, SubmitConfig, WorkerConfig,
};
use archive_bundler::coordinator::{Coordinator, RecoveryCoordinator};
use archive_bundler::job::{JobId, JobState};
use archive_bundler::partition::{collect_inputs, ArchivePartitioner};
use archive_bundler::queue::{MessageQueue, QueueKind, RedisQueue, RedisQueueConfig};
use archive_bundler::store::{JobStore, SqliteJobStore};
use archive_bundler::submit::{JobSubmitter, SubmitRequest};
use archive_bundler::worker::{ArchiveWorker, WorkDispatcher, WorkerProgress};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Initialize logging
    let directive = if args.verbose {
        "archive_bundler=debug"
    } else {
        "archive_bundler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    // Handle Ctrl+C
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        if shutdown_clone.load(Ordering::Relaxed) {
            eprintln!("\nForce shutdown!");
            std::process::exit(130);
        }
        eprintln!("\nShutting down gracefully... (press Ctrl+C again to force)");
        shutdown_clone.store(true, Ordering::SeqCst);
    })?;

    let host = args.host.as_deref();

    match args.command {
        Command::Submit {
            paths,
            archive_type,
            size,
            user,
            exclude_patterns,
            strip_prefixes,
            prefix,
            url_prefix,
            min_size_mb,
            max_size_mb,
            default_size_mb,
            compression_percent,
        } => {
            let config = SubmitConfig::from_submit_args(
                &paths,
                &archive_type,
                size.as_deref(),
                &user,
                &exclude_patterns,
                &strip_prefixes,
                prefix.as_deref(),
                url_prefix.as_deref(),
                min_size_mb,
                max_size_mb,
                default_size_mb,
                compression_percent,
                &args.output_dir,
                host,
                &args.redis,
            )?;
            run_submit(config, &args.db).await?
        }

        Command::Work {
            workers,
            worker_id,
            continuous,
            max_archives,
            no_recovery,
            threshold_hours,
            max_retries,
        } => {
            let queue_config = queue_config_from_url(&args.redis)?;
            let config = WorkerConfig::from_work_args(
                workers,
                worker_id.as_deref(),
                continuous,
                max_archives,
                host,
                &queue_config,
                args.quiet,
            )?;
            let recovery = if no_recovery {
                None
            } else {
                Some(RecoveryConfig::from_recover_args(threshold_hours, max_retries, host)?)
            };
            run_work(config, recovery, queue_config, &args.db, shutdown).await?
        }

        Command::Recover {
            threshold_hours,
            max_retries,
        } => {
            let config = RecoveryConfig::from_recover_args(threshold_hours, max_retries, host)?;
            run_recover(config, &args.redis, &args.db).await?
        }

        Command::Status {
            watch,
            interval,
            format,
        } => run_status(&args.redis, &args.db, watch, interval, &format, shutdown).await?,

        Command::Jobs {
            from,
            to,
            days,
            format,
        } => run_jobs(&args.db, from.as_deref(), to.as_deref(), days, &format)?,

        Command::Retry { job_id, archive } => {
            run_retry(&args.redis, &args.db, &job_id, archive).await?
        }
    }

    Ok(())
}

fn open_store(db: &Path) -> anyhow::Result<Arc<dyn JobStore>> {
    let store = SqliteJobStore::open(db)
        .with_context(|| format!("Failed to open job store {}", db.display()))?;
    Ok(Arc::new(store))
}

async fn open_queue(config: &RedisQueueConfig, kind: QueueKind) -> anyhow::Result<Arc<dyn MessageQueue>> {
    let queue = RedisQueue::new(config.clone(), kind)
        .await
        .with_context(|| format!("Failed to open {} queue at {}", kind.name(), config.url))?;
    Ok(Arc::new(queue))
}

fn spinner(quiet: bool) -> anyhow::Result<Option<ProgressBar>> {
    if quiet {
        return Ok(None);
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(Some(pb))
}

fn count_style(count: u64) -> String {
    if count > 0 {
        style(count).red().to_string()
    } else {
        style(count).dim().to_string()
    }
}

async fn run_submit(config: SubmitConfig, db: &Path) -> anyhow::Result<()> {
    let files = collect_inputs(&config.paths, &config.exclude_patterns)?;
    let total: u64 = files.iter().map(|f| f.size_bytes).sum();

    println!(
        "{} {} files ({}) from {} paths",
        style("[Submit]").cyan().bold(),
        style(files.len()).green(),
        style(format_size(total, BINARY)).yellow(),
        config.paths.len()
    );

    let store = open_store(db)?;
    let dispatch = open_queue(&config.queue_config, QueueKind::Dispatch).await?;
    let dispatcher = WorkDispatcher::new(store.clone(), dispatch);
    let submitter = JobSubmitter::new(
        ArchivePartitioner::new(config.partition),
        store,
        dispatcher,
        config.host_name,
    );

    let job = submitter
        .submit(SubmitRequest {
            user_name: config.user_name,
            archive_type: config.archive_type,
            target_size_mb: config.target_size_mb,
            files,
        })
        .await?;

    println!();
    println!("{}", style("Job Submitted").green().bold());
    println!("  Job ID: {}", style(&job.job_id).cyan());
    println!("  Type: {}", style(job.archive_type).yellow());
    println!(
        "  Archives: {} (target {})",
        style(job.num_archives).yellow(),
        style(format_size(job.target_archive_size_bytes, BINARY)).dim()
    );
    for archive in &job.archives {
        println!(
            "    {} {} ({} files, {})",
            style(archive.archive_id).dim(),
            archive.output_path.display(),
            archive.num_files(),
            format_size(archive.total_raw_size(), BINARY)
        );
    }

    Ok(())
}

async fn run_work(
    config: WorkerConfig,
    recovery: Option<RecoveryConfig>,
    queue_config: RedisQueueConfig,
    db: &Path,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    println!(
        "{} Starting worker {} ({} concurrent builds)",
        style("[Worker]").cyan().bold(),
        style(&config.worker_id).green(),
        config.worker_count
    );
    println!("  Host: {}", style(&config.host_name).yellow());
    println!("  Redis: {}", style(&queue_config.url).dim());
    println!(
        "  Mode: {}",
        if config.continuous {
            style("continuous").green()
        } else {
            style("until queue empty").yellow()
        }
    );
    println!();

    let store = open_store(db)?;
    let dispatch = open_queue(&queue_config, QueueKind::Dispatch).await?;
    let completion = open_queue(&queue_config, QueueKind::Completion).await?;

    if let Some(recovery) = recovery {
        let dispatcher = WorkDispatcher::new(store.clone(), dispatch.clone());
        let report = RecoveryCoordinator::new(recovery, store.clone(), dispatcher)
            .run()
            .await
            .context("Recovery pass failed")?;
        print_recovery(&report);
    }

    let aggregator = Arc::new(JobAggregator::new(store.clone(), completion.clone()));
    let aggregator_task = {
        let aggregator = aggregator.clone();
        let consumer = format!("{}-aggregator", config.worker_id);
        tokio::spawn(async move { aggregator.run(&consumer).await })
    };

    let show_progress = config.show_progress;
    let worker = ArchiveWorker::new(config, store, dispatch, completion);

    // Forward Ctrl+C to the worker and aggregator
    let worker_shutdown = worker.shutdown_flag();
    let signal_aggregator = aggregator.clone();
    tokio::spawn(async move {
        while !shutdown.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        worker_shutdown.store(true, Ordering::SeqCst);
        signal_aggregator.shutdown();
    });

    let pb = spinner(!show_progress)?;
    let pb_clone = pb.clone();
    let stats = worker
        .run(move |progress: WorkerProgress| {
            if let Some(ref pb) = pb_clone {
                let current = if progress.current.is_empty() {
                    "idle".to_string()
                } else {
                    progress.current.join(", ")
                };
                pb.set_message(format!(
                    "Built: {} | Failed: {} | Skipped: {} | Files: {} | {} | Errors: {} | Current: {}",
                    style(progress.archives_built).green(),
                    count_style(progress.archives_failed),
                    style(progress.archives_skipped).dim(),
                    style(progress.files_written).cyan(),
                    style(format_size(progress.bytes_written, BINARY)).dim(),
                    count_style(progress.errors),
                    style(current).yellow(),
                ));
            }
        })
        .await;

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    // Drain the completions this worker produced before exiting
    aggregator.finish();
    let aggregated = aggregator_task
        .await
        .context("Aggregator task panicked")??;
    let stats = stats?;

    println!();
    println!("{}", style("Worker Complete").green().bold());
    println!("  Archives built: {}", style(stats.archives_built).green());
    if stats.archives_failed > 0 {
        println!("  Archives failed: {}", style(stats.archives_failed).red());
    }
    if stats.archives_skipped > 0 {
        println!("  Archives skipped: {}", style(stats.archives_skipped).dim());
    }
    println!("  Files written: {}", style(stats.files_written).cyan());
    println!(
        "  Total size: {}",
        style(format_size(stats.bytes_written, BINARY)).yellow()
    );
    println!(
        "  Completions aggregated: {} ({} jobs complete)",
        style(aggregated.completions).cyan(),
        style(aggregated.jobs_completed).green()
    );
    let errors = stats.errors + aggregated.errors;
    if errors > 0 {
        println!("  Errors: {}", style(errors).red());
    }
    println!("  Duration: {:.1}s", stats.duration.as_secs_f64());

    Ok(())
}

fn print_recovery(report: &archive_bundler::coordinator::RecoveryReport) {
    if report.is_noop() {
        println!("{} Nothing to recover", style("[Recovery]").cyan().bold());
        return;
    }
    println!("{}", style("[Recovery]").cyan().bold());
    println!("  Invalid jobs: {}", style(report.invalidated).yellow());
    println!("  Jobs reconciled: {}", style(report.reconciled).green());
    println!("  Archives re-dispatched: {}", style(report.redispatched).cyan());
    if report.abandoned > 0 {
        println!("  Archives abandoned: {}", style(report.abandoned).red());
    }
    if report.failed_jobs > 0 {
        println!("  Jobs failed: {}", style(report.failed_jobs).red());
    }
    println!();
}

async fn run_recover(config: RecoveryConfig, redis_url: &str, db: &Path) -> anyhow::Result<()> {
    let store = open_store(db)?;
    let dispatch = open_queue(&queue_config_from_url(redis_url)?, QueueKind::Dispatch).await?;
    let dispatcher = WorkDispatcher::new(store.clone(), dispatch);

    println!(
        "{} Recovering work of {}",
        style("[Recovery]").cyan().bold(),
        style(&config.host_name).yellow()
    );
    let report = RecoveryCoordinator::new(config, store, dispatcher).run().await?;
    print_recovery(&report);

    Ok(())
}

async fn open_coordinator(redis_url: &str, db: &Path) -> anyhow::Result<Coordinator> {
    let queue_config = queue_config_from_url(redis_url)?;
    let store = open_store(db)?;
    let dispatch = open_queue(&queue_config, QueueKind::Dispatch).await?;
    let completion = open_queue(&queue_config, QueueKind::Completion).await?;
    Ok(Coordinator::new(
        store,
        dispatch,
        completion,
        queue_config.heartbeat_timeout,
    ))
}

async fn run_status(
    redis_url: &str,
    db: &Path,
    watch: bool,
    interval: u64,
    format: &str,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let coordinator = open_coordinator(redis_url, db).await?;

    loop {
        let status = coordinator.status().await?;

        if format == "json" {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            // Clear screen in watch mode
            if watch {
                let term = Term::stdout();
                let _ = term.clear_screen();
            }

            println!("{}", style("archive-bundler Status").cyan().bold());
            println!("{}", "=".repeat(50));
            println!();

            let health_style = match status.health.as_str() {
                "healthy" => style(&status.health).green(),
                "idle" => style(&status.health).dim(),
                "degraded" => style(&status.health).yellow(),
                _ => style(&status.health).red(),
            };
            println!("Health: {}", health_style.bold());
            println!();

            println!("{}", style("Jobs").yellow().bold());
            println!("  Not started: {}", style(status.jobs.not_started).dim());
            println!("  In progress: {}", style(status.jobs.in_progress).blue());
            println!("  Complete:    {}", style(status.jobs.complete).green());
            println!("  Error:       {}", count_style(status.jobs.error));
            println!("  Invalid:     {}", count_style(status.jobs.invalid_request));
            println!();

            for (title, stats) in [("Dispatch Queue", &status.dispatch), ("Completion Queue", &status.completion)] {
                println!("{}", style(title).yellow().bold());
                println!("  Pending:     {}", style(stats.pending).cyan());
                println!("  Processing:  {}", style(stats.processing).blue());
                println!("  Completed:   {}", style(stats.completed).green());
                println!("  Redelivered: {}", count_style(stats.redelivered));
                println!();
            }

            println!("{}", style("Workers").yellow().bold());
            if status.workers.is_empty() {
                println!("  {}", style("No workers registered").dim());
            } else {
                for worker in &status.workers {
                    let status_icon = if worker.is_alive {
                        style("●").green()
                    } else {
                        style("○").red()
                    };
                    println!(
                        "  {} {} (last seen: {}s ago)",
                        status_icon, worker.id, worker.seconds_since_heartbeat
                    );
                }
            }
            println!();

            if !status.messages.is_empty() {
                println!("{}", style("Messages").yellow().bold());
                for msg in &status.messages {
                    println!("  {} {}", style("!").yellow(), msg);
                }
                println!();
            }

            println!(
                "Last updated: {}",
                style(status.timestamp.format("%Y-%m-%d %H:%M:%S UTC")).dim()
            );
        }

        if !watch || shutdown.load(Ordering::Relaxed) {
            break;
        }

        tokio::time::sleep(Duration::from_secs(interval)).await;
    }

    Ok(())
}

/// Parse a YYYY-MM-DD date as the start (or end) of that day in UTC
fn parse_date(s: &str, end_of_day: bool) -> anyhow::Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .with_context(|| format!("Invalid date '{}'", s))
}

fn run_jobs(
    db: &Path,
    from: Option<&str>,
    to: Option<&str>,
    days: u32,
    format: &str,
) -> anyhow::Result<()> {
    let end = match to {
        Some(s) => parse_date(s, true)?,
        None => Utc::now(),
    };
    let start = match from {
        Some(s) => parse_date(s, false)?,
        None => end - chrono::Duration::days(i64::from(days)),
    };

    let store = open_store(db)?;
    let jobs = store.get_by_date_range(start, end)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    println!(
        "{} {} jobs between {} and {}",
        style("[Jobs]").cyan().bold(),
        jobs.len(),
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d")
    );
    for job in &jobs {
        let state = match job.state {
            JobState::Complete => style(job.state).green(),
            JobState::InProgress => style(job.state).blue(),
            JobState::NotStarted => style(job.state).dim(),
            JobState::Error | JobState::InvalidRequest => style(job.state).red(),
        };
        println!(
            "  {} {} {} {} {}/{} archives, {}/{} files, {}",
            style(job.created_at.format("%Y-%m-%d %H:%M")).dim(),
            job.job_id,
            state,
            job.archive_type,
            job.num_archives_complete,
            job.num_archives,
            job.num_files_complete,
            job.num_files,
            format_size(job.total_size_bytes, BINARY)
        );
    }

    Ok(())
}

async fn run_retry(redis_url: &str, db: &Path, job_id: &str, archive: Option<u32>) -> anyhow::Result<()> {
    let job_id: JobId = job_id.parse()?;
    let coordinator = open_coordinator(redis_url, db).await?;

    let retried = coordinator.retry_archives(&job_id, archive).await?;

    if retried.is_empty() {
        println!("No archives in ERROR to retry.");
    } else {
        println!(
            "{} Retried {} archive(s) of job {}.",
            style("Success:").green().bold(),
            retried.len(),
            style(&job_id).cyan()
        );
    }

    Ok(())
}
