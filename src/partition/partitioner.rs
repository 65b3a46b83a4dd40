//! Greedy archive partitioner
//!
//! Packs an ordered list of validated files into size-bounded archives in a
//! single pass. The decision to close an archive is driven by an estimate of
//! its compressed size, so the configured average compression percentage
//! directly controls how full archives get.

use std::path::PathBuf;

use crate::error::ConfigError;
use crate::job::{Archive, ArchiveType, FileEntry, Job, JobId};
use crate::partition::entry_path::normalize_entry_path;

/// Smallest accepted target archive size
pub const DEFAULT_MIN_ARCHIVE_SIZE_MB: u64 = 10;

/// Largest accepted target archive size
pub const DEFAULT_MAX_ARCHIVE_SIZE_MB: u64 = 2048;

/// Target archive size used when the request does not name one
pub const DEFAULT_ARCHIVE_SIZE_MB: u64 = 500;

/// Assumed average size reduction of the container format
pub const DEFAULT_AVERAGE_COMPRESSION_PERCENT: f64 = 20.0;

/// Extension of the checksum file written next to each archive
pub const HASH_EXTENSION: &str = "sha256";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// A file that upstream validation confirmed exists and is non-empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedFile {
    /// Absolute on-disk path
    pub source_path: PathBuf,
    /// Entry path requested by the client, if any
    pub entry_path: Option<String>,
    /// Size in bytes
    pub size_bytes: u64,
}

impl ValidatedFile {
    /// Create a validated file stored under its own source path
    pub fn new(source_path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            source_path: source_path.into(),
            entry_path: None,
            size_bytes,
        }
    }

    /// Store the file under an explicit entry path
    pub fn with_entry_path(mut self, entry_path: impl Into<String>) -> Self {
        self.entry_path = Some(entry_path.into());
        self
    }
}

/// Output naming: `<output_root>/<jobID>/<prefix>_<archiveID>.<ext>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveNaming {
    /// Directory under which each job gets its own output directory
    pub output_root: PathBuf,
    /// File name prefix; the job id when unset
    pub prefix: Option<String>,
    /// Public download URL prefix
    pub url_prefix: Option<String>,
}

impl Default for ArchiveNaming {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("archives"),
            prefix: None,
            url_prefix: None,
        }
    }
}

impl ArchiveNaming {
    /// Create naming rooted at `output_root`
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            ..Default::default()
        }
    }

    /// Directory holding every archive of a job
    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.output_root.join(job_id.as_str())
    }

    fn stem(&self, job_id: &JobId, archive_id: u32) -> String {
        let prefix = self.prefix.as_deref().unwrap_or(job_id.as_str());
        format!("{}_{}", prefix, archive_id)
    }

    /// Archive file name
    pub fn archive_file_name(&self, job_id: &JobId, archive_id: u32, archive_type: ArchiveType) -> String {
        format!("{}.{}", self.stem(job_id, archive_id), archive_type.extension())
    }

    /// Checksum file name
    pub fn hash_file_name(&self, job_id: &JobId, archive_id: u32) -> String {
        format!("{}.{}", self.stem(job_id, archive_id), HASH_EXTENSION)
    }

    /// Public URL for a file in the job directory
    pub fn url(&self, job_id: &JobId, file_name: &str) -> Option<String> {
        self.url_prefix
            .as_deref()
            .map(|prefix| format!("{}/{}/{}", prefix.trim_end_matches('/'), job_id, file_name))
    }

    /// Fill in output path, hash path and URL of an archive
    pub fn apply(&self, archive: &mut Archive) {
        let dir = self.job_dir(&archive.job_id);
        let file_name =
            self.archive_file_name(&archive.job_id, archive.archive_id, archive.archive_type);
        archive.url = self.url(&archive.job_id, &file_name);
        archive.output_path = dir.join(&file_name);
        archive.hash_path = dir.join(self.hash_file_name(&archive.job_id, archive.archive_id));
    }
}

/// Partitioning policy
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Lower bound for the target archive size
    pub min_archive_size_mb: u64,
    /// Upper bound for the target archive size
    pub max_archive_size_mb: u64,
    /// Target archive size when none is requested
    pub default_archive_size_mb: u64,
    /// Assumed compression, in [0, 100)
    pub average_compression_percent: f64,
    /// Absolute path prefixes stripped from entry paths
    pub path_exclusions: Vec<String>,
    /// Output naming
    pub naming: ArchiveNaming,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            min_archive_size_mb: DEFAULT_MIN_ARCHIVE_SIZE_MB,
            max_archive_size_mb: DEFAULT_MAX_ARCHIVE_SIZE_MB,
            default_archive_size_mb: DEFAULT_ARCHIVE_SIZE_MB,
            average_compression_percent: DEFAULT_AVERAGE_COMPRESSION_PERCENT,
            path_exclusions: Vec::new(),
            naming: ArchiveNaming::default(),
        }
    }
}

impl PartitionConfig {
    /// Check the size bounds and compression estimate
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_archive_size_mb == 0 {
            return Err(ConfigError::InvalidArchiveSize(
                "minimum archive size must be at least 1MB".into(),
            ));
        }
        if self.min_archive_size_mb > self.max_archive_size_mb {
            return Err(ConfigError::InvalidArchiveSize(format!(
                "minimum {}MB exceeds maximum {}MB",
                self.min_archive_size_mb, self.max_archive_size_mb
            )));
        }
        if self.default_archive_size_mb < self.min_archive_size_mb
            || self.default_archive_size_mb > self.max_archive_size_mb
        {
            return Err(ConfigError::InvalidArchiveSize(format!(
                "default {}MB outside [{}MB, {}MB]",
                self.default_archive_size_mb, self.min_archive_size_mb, self.max_archive_size_mb
            )));
        }
        let pct = self.average_compression_percent;
        if !pct.is_finite() || !(0.0..100.0).contains(&pct) {
            return Err(ConfigError::InvalidCompressionPercent(pct));
        }
        Ok(())
    }

    /// Clamp a requested size into the configured bounds
    pub fn clamp_target_mb(&self, requested_mb: Option<u64>) -> u64 {
        let requested = requested_mb.unwrap_or(self.default_archive_size_mb);
        let clamped = requested.clamp(self.min_archive_size_mb, self.max_archive_size_mb);
        if clamped != requested {
            tracing::debug!(
                "Target archive size {}MB clamped to {}MB",
                requested,
                clamped
            );
        }
        clamped
    }

    /// Estimated compressed size of `raw_bytes` of input
    pub fn estimate_compressed(&self, raw_bytes: u64) -> f64 {
        (1.0 - self.average_compression_percent / 100.0) * raw_bytes as f64
    }
}

/// Greedy single-pass bin packer
#[derive(Debug, Clone, Default)]
pub struct ArchivePartitioner {
    config: PartitionConfig,
}

impl ArchivePartitioner {
    /// Create a partitioner with the given policy
    pub fn new(config: PartitionConfig) -> Self {
        Self { config }
    }

    /// Get the policy
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Partition `files` into archives of at most `target_size_mb` estimated
    /// compressed bytes each.
    ///
    /// Files keep their input order. A file larger than the target forms an
    /// oversized archive of its own; nothing is ever rejected. An empty input
    /// yields a job with no archives.
    pub fn partition(
        &self,
        files: &[ValidatedFile],
        target_size_mb: u64,
        archive_type: ArchiveType,
    ) -> Job {
        let target_mb = self.config.clamp_target_mb(Some(target_size_mb));
        let target_bytes = target_mb * BYTES_PER_MB;

        let mut job = Job::new(archive_type, target_bytes);
        let mut accumulator: u64 = 0;

        for file in files {
            let estimate = self.config.estimate_compressed(accumulator + file.size_bytes);

            let needs_new = match job.archives.last() {
                None => true,
                Some(_) => estimate > target_bytes as f64,
            };
            if needs_new {
                let archive_id = job.archives.len() as u32;
                job.archives
                    .push(Archive::new(job.job_id.clone(), archive_id, archive_type));
                accumulator = 0;
            }

            let raw = file
                .entry_path
                .clone()
                .unwrap_or_else(|| file.source_path.to_string_lossy().to_string());
            let entry_path =
                normalize_entry_path(&raw, &self.config.path_exclusions, &file.source_path);

            if let Some(archive) = job.archives.last_mut() {
                archive.add_file(FileEntry::new(
                    file.source_path.clone(),
                    entry_path,
                    file.size_bytes,
                ));
            }
            accumulator += file.size_bytes;
            job.total_size_bytes += file.size_bytes;
            job.num_files += 1;
        }

        job.num_archives = job.archives.len() as u32;
        for archive in &mut job.archives {
            self.config.naming.apply(archive);
        }

        tracing::debug!(
            "Partitioned {} files ({} bytes) into {} archives of target {}MB",
            job.num_files,
            job.total_size_bytes,
            job.num_archives,
            target_mb
        );

        job
    }
}
