//! Configuration types for archive-bundler
//!
//! Defines CLI arguments and the runtime configuration built from them.

use crate::error::ConfigError;
use crate::partition::{
    ArchiveNaming, PartitionConfig, DEFAULT_ARCHIVE_SIZE_MB, DEFAULT_AVERAGE_COMPRESSION_PERCENT,
    DEFAULT_MAX_ARCHIVE_SIZE_MB, DEFAULT_MIN_ARCHIVE_SIZE_MB,
};
use crate::queue::RedisQueueConfig;
use clap::{Parser, Subcommand};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

/// Maximum reasonable worker count
const MAX_WORKERS: usize = 512;

/// Default processing-time threshold before recovery reconciles a job
pub const DEFAULT_PROCESSING_THRESHOLD_HOURS: f64 = 24.0;

/// Default number of recovery retries per archive
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Distributed archive bundler
#[derive(Parser, Debug, Clone)]
#[command(
    name = "archive-bundler",
    version,
    about = "Partition file sets into size-bounded archives and build them across a worker cluster",
    long_about = "Bundles large file sets into downloadable archives.\n\n\
                  A submission partitions the requested files into ZIP, TAR, GZIP or BZIP2\n\
                  archives of a target size and queues one build per archive.\n\
                  Workers on any node build archives in parallel; a recovery pass on every\n\
                  worker start repairs work left behind by a crash.",
    after_help = "EXAMPLES:\n    \
        # Bundle a directory into 500MB zip archives\n    \
        archive-bundler submit /data/project --type zip --size 500MB\n\n    \
        # Run workers until the queue drains\n    \
        archive-bundler work -w 8\n\n    \
        # Check job and queue status\n    \
        archive-bundler status --watch"
)]
pub struct CliArgs {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,

    /// Redis URL for queue coordination
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379", global = true)]
    pub redis: String,

    /// Job store database file
    #[arg(long, env = "ARCHIVE_BUNDLER_DB", default_value = "archive-bundler.db", global = true)]
    pub db: PathBuf,

    /// Directory archives are written under
    #[arg(long, env = "ARCHIVE_BUNDLER_OUTPUT", default_value = "archives", global = true)]
    pub output_dir: PathBuf,

    /// Identity of this node (defaults to the host name)
    #[arg(long, env = "ARCHIVE_BUNDLER_HOST", global = true)]
    pub host: Option<String>,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Submit files for bundling
    Submit {
        /// Files or directories to bundle
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Archive type (zip, tar, gzip, bzip2)
        #[arg(short = 't', long = "type", default_value = "zip", value_name = "TYPE")]
        archive_type: String,

        /// Target archive size (e.g., "500MB", "2GB")
        #[arg(short = 's', long, value_name = "SIZE")]
        size: Option<String>,

        /// Requesting user
        #[arg(short = 'u', long, default_value = "", value_name = "NAME")]
        user: String,

        /// Skip files whose path matches pattern (can be repeated)
        #[arg(long = "exclude", value_name = "PATTERN", action = clap::ArgAction::Append)]
        exclude_patterns: Vec<String>,

        /// Strip an absolute path prefix from entry names (can be repeated)
        #[arg(long = "strip-prefix", value_name = "PREFIX", action = clap::ArgAction::Append)]
        strip_prefixes: Vec<String>,

        /// Archive file name prefix (defaults to the job id)
        #[arg(long, value_name = "PREFIX")]
        prefix: Option<String>,

        /// Public URL prefix for download links
        #[arg(long, env = "ARCHIVE_BUNDLER_URL_PREFIX", value_name = "URL")]
        url_prefix: Option<String>,

        /// Smallest allowed target size in MB
        #[arg(long, default_value_t = DEFAULT_MIN_ARCHIVE_SIZE_MB, value_name = "MB")]
        min_size_mb: u64,

        /// Largest allowed target size in MB
        #[arg(long, default_value_t = DEFAULT_MAX_ARCHIVE_SIZE_MB, value_name = "MB")]
        max_size_mb: u64,

        /// Target size in MB when --size is not given
        #[arg(long, default_value_t = DEFAULT_ARCHIVE_SIZE_MB, value_name = "MB")]
        default_size_mb: u64,

        /// Assumed average compression when estimating archive sizes
        #[arg(long, default_value_t = DEFAULT_AVERAGE_COMPRESSION_PERCENT, value_name = "PERCENT")]
        compression_percent: f64,
    },

    /// Run archive workers and the completion aggregator
    Work {
        /// Number of concurrent archive builds
        #[arg(short = 'w', long, default_value_t = default_workers(), value_name = "NUM")]
        workers: usize,

        /// Worker ID (auto-generated if not specified)
        #[arg(long, value_name = "ID")]
        worker_id: Option<String>,

        /// Run continuously (don't exit when queue is empty)
        #[arg(long)]
        continuous: bool,

        /// Exit after processing N archives (for testing)
        #[arg(long, value_name = "NUM")]
        max_archives: Option<u64>,

        /// Skip the startup recovery pass
        #[arg(long)]
        no_recovery: bool,

        /// Hours after which recovery reconciles an unfinished job
        #[arg(long, default_value_t = DEFAULT_PROCESSING_THRESHOLD_HOURS, value_name = "HOURS")]
        threshold_hours: f64,

        /// Recovery retries per archive before it is parked in ERROR
        #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, value_name = "NUM")]
        max_retries: u32,
    },

    /// Run the recovery pass for this node and exit
    Recover {
        /// Hours after which an unfinished job is reconciled
        #[arg(long, default_value_t = DEFAULT_PROCESSING_THRESHOLD_HOURS, value_name = "HOURS")]
        threshold_hours: f64,

        /// Retries per archive before it is parked in ERROR
        #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, value_name = "NUM")]
        max_retries: u32,
    },

    /// Show job, queue and worker status
    Status {
        /// Watch mode - continuously update status
        #[arg(short, long)]
        watch: bool,

        /// Update interval for watch mode (seconds)
        #[arg(long, default_value = "2", value_name = "SECS")]
        interval: u64,

        /// Output format (text, json)
        #[arg(long, default_value = "text", value_name = "FORMAT")]
        format: String,
    },

    /// List jobs submitted within a date range
    Jobs {
        /// Start date (YYYY-MM-DD), defaults to --days ago
        #[arg(long, value_name = "DATE")]
        from: Option<String>,

        /// End date (YYYY-MM-DD, inclusive), defaults to now
        #[arg(long, value_name = "DATE")]
        to: Option<String>,

        /// Days to look back when --from is not given
        #[arg(long, default_value = "7", value_name = "DAYS")]
        days: u32,

        /// Output format (text, json)
        #[arg(long, default_value = "text", value_name = "FORMAT")]
        format: String,
    },

    /// Retry archives parked in ERROR
    Retry {
        /// Job whose archives to retry
        #[arg(value_name = "JOB_ID")]
        job_id: String,

        /// Retry only this archive
        #[arg(long, value_name = "ID")]
        archive: Option<u32>,
    },
}

fn default_workers() -> usize {
    num_cpus::get()
}

/// Parse a human-readable size string (e.g., "2GB", "500MB")
pub fn parse_size(s: &str) -> Result<u64, ConfigError> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("TB") {
        (n, 1024u64 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("GB") {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("MB") {
        (n, BYTES_PER_MB)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1u64)
    } else {
        // Assume bytes if no suffix
        (s.as_str(), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidArchiveSize(format!("Invalid size value: {}", s)))?;
    if !num.is_finite() || num < 0.0 {
        return Err(ConfigError::InvalidArchiveSize(format!(
            "Invalid size value: {}",
            s
        )));
    }

    Ok((num * multiplier as f64) as u64)
}

/// Convert a size in bytes to whole megabytes, rounding up
pub fn bytes_to_mb(bytes: u64) -> u64 {
    bytes.div_ceil(BYTES_PER_MB)
}

/// Convert a positive number of hours into a duration
pub fn parse_hours(hours: f64) -> Result<Duration, ConfigError> {
    if !hours.is_finite() || hours <= 0.0 {
        return Err(ConfigError::InvalidThreshold(hours));
    }
    Ok(Duration::from_secs_f64(hours * 3600.0))
}

/// Identity of this node: the explicit value, else the host name
pub fn resolve_host_name(explicit: Option<&str>) -> String {
    match explicit.map(str::trim).filter(|h| !h.is_empty()) {
        Some(host) => host.to_string(),
        None => hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
    }
}

/// Queue config for `url`, which must use a Redis scheme
pub fn queue_config_from_url(url: &str) -> Result<RedisQueueConfig, ConfigError> {
    let url = url.trim();
    let valid = ["redis://", "rediss://", "redis+unix://", "unix://"]
        .iter()
        .any(|scheme| url.len() > scheme.len() && url.starts_with(scheme));
    if !valid {
        return Err(ConfigError::InvalidRedisUrl(url.to_string()));
    }
    Ok(RedisQueueConfig::with_url(url))
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| ConfigError::InvalidPattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Configuration for a submission
#[derive(Debug, Clone)]
pub struct SubmitConfig {
    /// Files or directories named on the request
    pub paths: Vec<PathBuf>,
    /// Requested archive type, resolved leniently
    pub archive_type: String,
    /// Requested target size in MB
    pub target_size_mb: Option<u64>,
    /// Requesting user
    pub user_name: String,
    /// Compiled skip patterns
    pub exclude_patterns: Vec<Regex>,
    /// Partitioning policy
    pub partition: PartitionConfig,
    /// Node accepting the submission
    pub host_name: String,
    /// Redis queue config
    pub queue_config: RedisQueueConfig,
}

impl SubmitConfig {
    /// Create from CLI args
    #[allow(clippy::too_many_arguments)]
    pub fn from_submit_args(
        paths: &[PathBuf],
        archive_type: &str,
        size: Option<&str>,
        user: &str,
        exclude_patterns: &[String],
        strip_prefixes: &[String],
        prefix: Option<&str>,
        url_prefix: Option<&str>,
        min_size_mb: u64,
        max_size_mb: u64,
        default_size_mb: u64,
        compression_percent: f64,
        output_dir: &PathBuf,
        host: Option<&str>,
        redis_url: &str,
    ) -> Result<Self, ConfigError> {
        let target_size_mb = size.map(parse_size).transpose()?.map(bytes_to_mb);

        if output_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidOutputPath {
                path: output_dir.clone(),
                reason: "output directory must not be empty".into(),
            });
        }

        let partition = PartitionConfig {
            min_archive_size_mb: min_size_mb,
            max_archive_size_mb: max_size_mb,
            default_archive_size_mb: default_size_mb,
            average_compression_percent: compression_percent,
            path_exclusions: strip_prefixes.to_vec(),
            naming: ArchiveNaming {
                output_root: output_dir.clone(),
                prefix: prefix.map(str::to_string),
                url_prefix: url_prefix.map(str::to_string),
            },
        };
        partition.validate()?;

        Ok(Self {
            paths: paths.to_vec(),
            archive_type: archive_type.to_string(),
            target_size_mb,
            user_name: user.to_string(),
            exclude_patterns: compile_patterns(exclude_patterns)?,
            partition,
            host_name: resolve_host_name(host),
            queue_config: queue_config_from_url(redis_url)?,
        })
    }
}

/// Configuration for the archive worker pool
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Node identity recorded on claimed archives
    pub host_name: String,
    /// Worker ID
    pub worker_id: String,
    /// Number of concurrent builds
    pub worker_count: usize,
    /// Run continuously
    pub continuous: bool,
    /// Max archives to process
    pub max_archives: Option<u64>,
    /// Heartbeat interval
    pub heartbeat_interval: Duration,
    /// Show progress
    pub show_progress: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let host_name = resolve_host_name(None);
        Self {
            worker_id: generate_worker_id(&host_name),
            host_name,
            worker_count: 1,
            continuous: false,
            max_archives: None,
            heartbeat_interval: Duration::from_secs(10),
            show_progress: false,
        }
    }
}

fn generate_worker_id(host_name: &str) -> String {
    format!("{}-{}", host_name, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

impl WorkerConfig {
    /// Create from CLI args
    pub fn from_work_args(
        workers: usize,
        worker_id: Option<&str>,
        continuous: bool,
        max_archives: Option<u64>,
        host: Option<&str>,
        queue_config: &RedisQueueConfig,
        quiet: bool,
    ) -> Result<Self, ConfigError> {
        // Validate workers
        if workers == 0 || workers > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                count: workers,
                max: MAX_WORKERS,
            });
        }

        let host_name = resolve_host_name(host);
        let worker_id = worker_id
            .map(str::to_string)
            .unwrap_or_else(|| generate_worker_id(&host_name));

        Ok(Self {
            host_name,
            worker_id,
            worker_count: workers,
            continuous,
            max_archives,
            heartbeat_interval: queue_config.heartbeat_interval,
            show_progress: !quiet,
        })
    }
}

/// Configuration for the startup recovery pass
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Node whose orphaned archives are retried
    pub host_name: String,
    /// Age after which an unfinished job is reconciled from its archives
    pub processing_time_threshold: Duration,
    /// Retries per archive before it is parked in ERROR
    pub max_retries: u32,
}

impl RecoveryConfig {
    /// Create a config for `host_name` with default limits
    pub fn new(host_name: &str) -> Self {
        Self {
            host_name: host_name.to_string(),
            processing_time_threshold: Duration::from_secs_f64(
                DEFAULT_PROCESSING_THRESHOLD_HOURS * 3600.0,
            ),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Create from CLI args
    pub fn from_recover_args(
        threshold_hours: f64,
        max_retries: u32,
        host: Option<&str>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            host_name: resolve_host_name(host),
            processing_time_threshold: parse_hours(threshold_hours)?,
            max_retries,
        })
    }
}
