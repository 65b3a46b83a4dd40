//! Job, Archive and FileEntry types
//!
//! A Job is one client bundle request. It owns an ordered list of Archives
//! (the unit of work distribution), each of which owns the FileEntries that
//! will be written into its container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{BundlerError, RequestError, Result};

/// Length of a job identifier in characters
pub const JOB_ID_LEN: usize = 32;

/// Opaque, fixed-length job identifier (32 lowercase hex characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Borrow the identifier text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = RequestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != JOB_ID_LEN || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RequestError::InvalidJobId(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for JobId {
    type Error = RequestError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Container format of an archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveType {
    #[default]
    Zip,
    Tar,
    Gzip,
    Bzip2,
}

impl ArchiveType {
    /// All supported container formats
    pub const ALL: [ArchiveType; 4] = [
        ArchiveType::Zip,
        ArchiveType::Tar,
        ArchiveType::Gzip,
        ArchiveType::Bzip2,
    ];

    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveType::Zip => "ZIP",
            ArchiveType::Tar => "TAR",
            ArchiveType::Gzip => "GZIP",
            ArchiveType::Bzip2 => "BZIP2",
        }
    }

    /// File extension: the lower-case text form of the type
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveType::Zip => "zip",
            ArchiveType::Tar => "tar",
            ArchiveType::Gzip => "gzip",
            ArchiveType::Bzip2 => "bzip2",
        }
    }

    /// Parse leniently, substituting ZIP for anything unrecognized.
    ///
    /// Older clients send free-form type strings; an unknown type is never a
    /// hard failure.
    pub fn parse_or_default(s: &str) -> Self {
        match s.parse() {
            Ok(archive_type) => archive_type,
            Err(_) => {
                tracing::warn!(
                    "Unsupported archive type '{}', falling back to {}",
                    s,
                    ArchiveType::Zip
                );
                ArchiveType::Zip
            }
        }
    }
}

impl FromStr for ArchiveType {
    type Err = RequestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zip" => Ok(ArchiveType::Zip),
            "tar" => Ok(ArchiveType::Tar),
            "gzip" | "gz" | "tgz" => Ok(ArchiveType::Gzip),
            "bzip2" | "bz2" | "tbz2" => Ok(ArchiveType::Bzip2),
            _ => Err(RequestError::UnknownArchiveType(s.to_string())),
        }
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Partitioned and persisted, not yet dispatched
    NotStarted,
    /// Archives have been dispatched
    InProgress,
    /// Every archive is complete
    Complete,
    /// Parked after archives exhausted their retries
    Error,
    /// Submitted with no processable files
    InvalidRequest,
}

impl JobState {
    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::NotStarted => "NOT_STARTED",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Complete => "COMPLETE",
            JobState::Error => "ERROR",
            JobState::InvalidRequest => "INVALID_REQUEST",
        }
    }

    /// Whether no further processing will happen without operator action
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Complete | JobState::Error | JobState::InvalidRequest
        )
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(JobState::NotStarted),
            "IN_PROGRESS" => Ok(JobState::InProgress),
            "COMPLETE" => Ok(JobState::Complete),
            "ERROR" => Ok(JobState::Error),
            "INVALID_REQUEST" => Ok(JobState::InvalidRequest),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveState {
    NotStarted,
    InProgress,
    Complete,
    Error,
}

impl ArchiveState {
    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveState::NotStarted => "NOT_STARTED",
            ArchiveState::InProgress => "IN_PROGRESS",
            ArchiveState::Complete => "COMPLETE",
            ArchiveState::Error => "ERROR",
        }
    }
}

impl FromStr for ArchiveState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(ArchiveState::NotStarted),
            "IN_PROGRESS" => Ok(ArchiveState::InProgress),
            "COMPLETE" => Ok(ArchiveState::Complete),
            "ERROR" => Ok(ArchiveState::Error),
            other => Err(format!("unknown archive state '{}'", other)),
        }
    }
}

impl fmt::Display for ArchiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a file entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    #[default]
    NotStarted,
    Complete,
}

impl FileState {
    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::NotStarted => "NOT_STARTED",
            FileState::Complete => "COMPLETE",
        }
    }
}

impl FromStr for FileState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(FileState::NotStarted),
            "COMPLETE" => Ok(FileState::Complete),
            other => Err(format!("unknown file state '{}'", other)),
        }
    }
}

/// One input file mapped to its position inside an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Absolute on-disk path
    pub source_path: PathBuf,
    /// Path recorded inside the container (never starts with a separator)
    pub entry_path: String,
    /// Raw size in bytes
    pub size_bytes: u64,
    /// Whether the file made it into the container
    pub state: FileState,
}

impl FileEntry {
    /// Create a new entry
    pub fn new(source_path: PathBuf, entry_path: String, size_bytes: u64) -> Self {
        Self {
            source_path,
            entry_path,
            size_bytes,
            state: FileState::NotStarted,
        }
    }

    /// Check if the entry was written
    pub fn is_complete(&self) -> bool {
        self.state == FileState::Complete
    }
}

/// One container-format output unit within a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    /// Owning job
    pub job_id: JobId,
    /// Zero-based sequence number within the job
    pub archive_id: u32,
    /// Container format
    pub archive_type: ArchiveType,
    /// Files to write, in input order
    pub files: Vec<FileEntry>,
    /// Size of the built container
    pub size_bytes: u64,
    /// Final container location
    pub output_path: PathBuf,
    /// Location of the checksum file
    pub hash_path: PathBuf,
    /// Public download URL, when configured
    pub url: Option<String>,
    /// Current state
    pub state: ArchiveState,
    /// Node that is (or was) processing this archive
    pub host_name: Option<String>,
    /// Worker that is (or was) processing this archive
    pub worker_id: Option<String>,
    /// When the current build attempt started
    pub start_time: Option<DateTime<Utc>>,
    /// When the last build attempt ended
    pub end_time: Option<DateTime<Utc>>,
    /// When a dispatch message was last enqueued
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Number of recovery-triggered retries
    pub retry_count: u32,
    /// Build attempt, bumped on every reset. Unlike `retry_count` it never
    /// goes back down, so queue messages stamped with an older attempt can
    /// be told apart from current ones.
    #[serde(default)]
    pub attempt: u32,
    /// Error message from the last failed attempt
    pub error_message: Option<String>,
}

impl Archive {
    /// Create a new empty archive
    pub fn new(job_id: JobId, archive_id: u32, archive_type: ArchiveType) -> Self {
        Self {
            job_id,
            archive_id,
            archive_type,
            files: Vec::new(),
            size_bytes: 0,
            output_path: PathBuf::new(),
            hash_path: PathBuf::new(),
            url: None,
            state: ArchiveState::NotStarted,
            host_name: None,
            worker_id: None,
            start_time: None,
            end_time: None,
            dispatched_at: None,
            retry_count: 0,
            attempt: 0,
            error_message: None,
        }
    }

    /// Add a file entry
    pub fn add_file(&mut self, entry: FileEntry) {
        self.files.push(entry);
    }

    /// Number of files assigned to this archive
    pub fn num_files(&self) -> u64 {
        self.files.len() as u64
    }

    /// Sum of raw file sizes assigned to this archive
    pub fn total_raw_size(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }

    /// Number of files written into the container
    pub fn num_files_complete(&self) -> u64 {
        self.files.iter().filter(|f| f.is_complete()).count() as u64
    }

    /// Raw bytes of the files written into the container
    pub fn raw_size_complete(&self) -> u64 {
        self.files
            .iter()
            .filter(|f| f.is_complete())
            .map(|f| f.size_bytes)
            .sum()
    }

    /// Check if the archive is complete
    pub fn is_complete(&self) -> bool {
        self.state == ArchiveState::Complete
    }

    /// Mark as being built by a worker
    pub fn mark_in_progress(&mut self, host_name: &str, worker_id: &str) {
        self.state = ArchiveState::InProgress;
        self.host_name = Some(host_name.to_string());
        self.worker_id = Some(worker_id.to_string());
        self.start_time = Some(Utc::now());
        self.end_time = None;
        self.error_message = None;
    }

    /// Mark as built; `written` holds indices into `files`
    pub fn mark_complete(&mut self, size_bytes: u64, written: &[usize]) {
        for &index in written {
            if let Some(entry) = self.files.get_mut(index) {
                entry.state = FileState::Complete;
            }
        }
        self.size_bytes = size_bytes;
        self.state = ArchiveState::Complete;
        self.end_time = Some(Utc::now());
        self.error_message = None;
    }

    /// Mark as failed
    pub fn mark_error(&mut self, error: &str) {
        self.state = ArchiveState::Error;
        self.error_message = Some(error.to_string());
        self.end_time = Some(Utc::now());
    }

    /// Record that a dispatch message was enqueued
    pub fn mark_dispatched(&mut self) {
        self.dispatched_at = Some(Utc::now());
    }

    /// Return to NOT_STARTED ahead of a re-dispatch.
    ///
    /// `host_name` is kept so the node that requeued the archive still owns
    /// it until a worker claims it.
    pub fn reset_for_retry(&mut self) {
        self.state = ArchiveState::NotStarted;
        self.worker_id = None;
        self.start_time = None;
        self.end_time = None;
        self.dispatched_at = None;
        self.size_bytes = 0;
        self.error_message = None;
        self.retry_count += 1;
        self.attempt += 1;
        for entry in &mut self.files {
            entry.state = FileState::NotStarted;
        }
    }
}

/// Outcome of a rollup recomputation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupReport {
    /// Rollups that exceeded their job-level total and were clamped
    pub clamped: Vec<&'static str>,
    /// Rollups that would have decreased and were held
    pub held: Vec<&'static str>,
}

impl RollupReport {
    /// Whether any correction was applied
    pub fn is_consistent(&self) -> bool {
        self.clamped.is_empty() && self.held.is_empty()
    }
}

/// One client bundle request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier
    pub job_id: JobId,
    /// Container format for every archive
    pub archive_type: ArchiveType,
    /// Size budget per archive
    pub target_archive_size_bytes: u64,
    /// Requesting user
    pub user_name: String,
    /// Current state
    pub state: JobState,
    /// Total files requested
    pub num_files: u64,
    /// Total raw bytes requested
    pub total_size_bytes: u64,
    /// Number of archives the files were partitioned into
    pub num_archives: u32,
    /// Archives that reached COMPLETE
    pub num_archives_complete: u32,
    /// Files written into complete archives
    pub num_files_complete: u64,
    /// Raw bytes written into complete archives
    pub total_size_complete_bytes: u64,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// When dispatch began
    pub start_time: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub end_time: Option<DateTime<Utc>>,
    /// Node that accepted the submission
    pub origin_host: Option<String>,
    /// Archive children, ordered by `archive_id`
    pub archives: Vec<Archive>,
    /// Optimistic concurrency counter, bumped by every store update
    pub version: u64,
}

impl Job {
    /// Create a new job with no archives
    pub fn new(archive_type: ArchiveType, target_archive_size_bytes: u64) -> Self {
        Self {
            job_id: JobId::generate(),
            archive_type,
            target_archive_size_bytes,
            user_name: String::new(),
            state: JobState::NotStarted,
            num_files: 0,
            total_size_bytes: 0,
            num_archives: 0,
            num_archives_complete: 0,
            num_files_complete: 0,
            total_size_complete_bytes: 0,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            origin_host: None,
            archives: Vec::new(),
            version: 0,
        }
    }

    /// Look up an archive by id
    pub fn archive(&self, archive_id: u32) -> Option<&Archive> {
        match self.archives.get(archive_id as usize) {
            Some(archive) if archive.archive_id == archive_id => Some(archive),
            _ => self.archives.iter().find(|a| a.archive_id == archive_id),
        }
    }

    /// Look up an archive by id for mutation
    pub fn archive_mut(&mut self, archive_id: u32) -> Option<&mut Archive> {
        let index = match self.archives.get(archive_id as usize) {
            Some(archive) if archive.archive_id == archive_id => archive_id as usize,
            _ => self
                .archives
                .iter()
                .position(|a| a.archive_id == archive_id)?,
        };
        self.archives.get_mut(index)
    }

    /// Whether the job is still expected to make progress
    pub fn is_incomplete(&self) -> bool {
        matches!(self.state, JobState::NotStarted | JobState::InProgress)
    }

    /// Whether every archive is complete (false for a job with no archives)
    pub fn all_archives_complete(&self) -> bool {
        !self.archives.is_empty() && self.archives.iter().all(|a| a.is_complete())
    }

    /// Time since dispatch began, or since submission if never dispatched
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.start_time.unwrap_or(self.created_at)
    }

    /// Mark as dispatched
    pub fn mark_in_progress(&mut self) {
        self.state = JobState::InProgress;
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
        self.end_time = None;
    }

    /// Mark as complete
    pub fn mark_complete(&mut self) {
        self.state = JobState::Complete;
        self.end_time = Some(Utc::now());
    }

    /// Mark as failed
    pub fn mark_error(&mut self) {
        self.state = JobState::Error;
        self.end_time = Some(Utc::now());
    }

    /// Mark as an invalid request; both timestamps are set to now
    pub fn mark_invalid(&mut self) {
        let now = Utc::now();
        self.state = JobState::InvalidRequest;
        self.start_time = Some(now);
        self.end_time = Some(now);
    }

    /// Recompute completion rollups from the archive children.
    ///
    /// Rollups are clamped to their job-level totals and never decrease.
    pub fn recompute_rollups(&mut self) -> RollupReport {
        let mut report = RollupReport::default();

        let complete: Vec<&Archive> = self.archives.iter().filter(|a| a.is_complete()).collect();
        let archives_complete = complete.len() as u64;
        let files_complete: u64 = complete.iter().map(|a| a.num_files_complete()).sum();
        let bytes_complete: u64 = complete.iter().map(|a| a.raw_size_complete()).sum();

        self.num_archives_complete = settle_rollup(
            &self.job_id,
            "num_archives_complete",
            archives_complete,
            u64::from(self.num_archives),
            u64::from(self.num_archives_complete),
            &mut report,
        ) as u32;
        self.num_files_complete = settle_rollup(
            &self.job_id,
            "num_files_complete",
            files_complete,
            self.num_files,
            self.num_files_complete,
            &mut report,
        );
        self.total_size_complete_bytes = settle_rollup(
            &self.job_id,
            "total_size_complete_bytes",
            bytes_complete,
            self.total_size_bytes,
            self.total_size_complete_bytes,
            &mut report,
        );

        report
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| BundlerError::Serialization(e.to_string()))
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| BundlerError::Serialization(e.to_string()))
    }
}

fn settle_rollup(
    job_id: &JobId,
    name: &'static str,
    recomputed: u64,
    total: u64,
    previous: u64,
    report: &mut RollupReport,
) -> u64 {
    let mut value = recomputed;
    if value > total {
        tracing::warn!(
            "Job {}: {} recomputed as {} exceeds total {}, clamping",
            job_id,
            name,
            value,
            total
        );
        report.clamped.push(name);
        value = total;
    }
    if value < previous {
        tracing::warn!(
            "Job {}: {} would drop from {} to {}, keeping previous value",
            job_id,
            name,
            previous,
            value
        );
        report.held.push(name);
        value = previous;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_archives(sizes: &[&[u64]]) -> Job {
        let mut job = Job::new(ArchiveType::Zip, 1024);
        for (id, files) in sizes.iter().enumerate() {
            let mut archive = Archive::new(job.job_id.clone(), id as u32, ArchiveType::Zip);
            for (n, size) in files.iter().enumerate() {
                archive.add_file(FileEntry::new(
                    PathBuf::from(format!("/src/{}-{}", id, n)),
                    format!("{}-{}", id, n),
                    *size,
                ));
                job.num_files += 1;
                job.total_size_bytes += size;
            }
            job.archives.push(archive);
        }
        job.num_archives = job.archives.len() as u32;
        job
    }

    #[test]
    fn test_job_id_format() {
        let id = JobId::generate();
        assert_eq!(id.as_str().len(), JOB_ID_LEN);

        let parsed: JobId = id.as_str().to_uppercase().parse().unwrap();
        assert_eq!(parsed, id);

        assert!("not-a-job".parse::<JobId>().is_err());
        assert!("g".repeat(JOB_ID_LEN).parse::<JobId>().is_err());
    }

    #[test]
    fn test_archive_type_parsing() {
        assert_eq!("zip".parse::<ArchiveType>().unwrap(), ArchiveType::Zip);
        assert_eq!("TAR".parse::<ArchiveType>().unwrap(), ArchiveType::Tar);
        assert_eq!("gz".parse::<ArchiveType>().unwrap(), ArchiveType::Gzip);
        assert_eq!("bzip2".parse::<ArchiveType>().unwrap(), ArchiveType::Bzip2);
        assert!("rar".parse::<ArchiveType>().is_err());

        assert_eq!(ArchiveType::parse_or_default("rar"), ArchiveType::Zip);
        assert_eq!(ArchiveType::parse_or_default("Bzip2"), ArchiveType::Bzip2);
    }

    #[test]
    fn test_archive_type_extension_is_lowercase_name() {
        for archive_type in ArchiveType::ALL {
            assert_eq!(
                archive_type.extension(),
                archive_type.as_str().to_lowercase()
            );
        }
    }

    #[test]
    fn test_archive_state_transitions() {
        let mut job = job_with_archives(&[&[10, 20]]);
        let archive = job.archive_mut(0).unwrap();
        assert_eq!(archive.state, ArchiveState::NotStarted);

        archive.mark_in_progress("node-a", "node-a-1");
        assert_eq!(archive.state, ArchiveState::InProgress);
        assert_eq!(archive.host_name.as_deref(), Some("node-a"));
        assert!(archive.start_time.is_some());

        archive.mark_complete(25, &[1]);
        assert!(archive.is_complete());
        assert_eq!(archive.num_files_complete(), 1);
        assert_eq!(archive.raw_size_complete(), 20);
        assert!(archive.end_time.is_some());

        archive.reset_for_retry();
        assert_eq!(archive.state, ArchiveState::NotStarted);
        assert_eq!(archive.retry_count, 1);
        assert_eq!(archive.attempt, 1);
        assert_eq!(archive.num_files_complete(), 0);
        assert_eq!(archive.host_name.as_deref(), Some("node-a"));
    }

    #[test]
    fn test_recompute_rollups_counts_complete_archives_only() {
        let mut job = job_with_archives(&[&[10, 20], &[30], &[40]]);
        job.archive_mut(0).unwrap().mark_complete(25, &[0, 1]);
        job.archive_mut(2).unwrap().mark_error("disk full");

        let report = job.recompute_rollups();
        assert!(report.is_consistent());
        assert_eq!(job.num_archives_complete, 1);
        assert_eq!(job.num_files_complete, 2);
        assert_eq!(job.total_size_complete_bytes, 30);
    }

    #[test]
    fn test_recompute_rollups_clamps_to_totals() {
        let mut job = job_with_archives(&[&[10], &[20]]);
        job.archive_mut(0).unwrap().mark_complete(5, &[0]);
        job.archive_mut(1).unwrap().mark_complete(5, &[0]);
        job.num_files = 1;

        let report = job.recompute_rollups();
        assert_eq!(report.clamped, vec!["num_files_complete"]);
        assert_eq!(job.num_files_complete, 1);
    }

    #[test]
    fn test_recompute_rollups_never_decreases() {
        let mut job = job_with_archives(&[&[10], &[20]]);
        job.archive_mut(0).unwrap().mark_complete(5, &[0]);
        job.recompute_rollups();
        assert_eq!(job.num_archives_complete, 1);

        job.archive_mut(0).unwrap().reset_for_retry();
        let report = job.recompute_rollups();
        assert!(report.held.contains(&"num_archives_complete"));
        assert_eq!(job.num_archives_complete, 1);
        assert_eq!(job.total_size_complete_bytes, 10);
    }

    #[test]
    fn test_job_serialization() {
        let job = job_with_archives(&[&[1, 2], &[3]]);
        let json = job.to_json().unwrap();
        let restored = Job::from_json(&json).unwrap();
        assert_eq!(restored, job);
    }

    #[test]
    fn test_mark_invalid_sets_both_timestamps() {
        let mut job = Job::new(ArchiveType::Tar, 1);
        job.mark_invalid();
        assert_eq!(job.state, JobState::InvalidRequest);
        assert_eq!(job.start_time, job.end_time);
        assert!(job.start_time.is_some());
    }
}
