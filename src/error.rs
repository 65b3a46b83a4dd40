//! Error types for archive-bundler
//!
//! Error hierarchy covering:
//! - Job store errors (including optimistic-concurrency conflicts)
//! - Work queue errors (Redis)
//! - Archive build errors
//! - Configuration and request-shape errors
//! - Worker errors
//!
//! Per-file problems during a build (a source file vanished since
//! validation) are deliberately absent: they are skipped and reported in the
//! build report, never raised.

use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobId;

/// Top-level error type for archive-bundler
#[derive(Error, Debug)]
pub enum BundlerError {
    /// Job store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Queue errors (Redis or in-memory)
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Archive build errors
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Rejected client requests
    #[error("Request rejected: {0}")]
    Request(#[from] RequestError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to open the store
    #[error("Failed to open job store at '{path}': {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    /// Job does not exist
    #[error("Job '{job_id}' not found")]
    NotFound { job_id: JobId },

    /// Job was persisted twice
    #[error("Job '{job_id}' already exists")]
    AlreadyExists { job_id: JobId },

    /// Another writer updated the job since it was loaded
    #[error("Job '{job_id}' was modified concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        job_id: JobId,
        expected: u64,
        found: u64,
    },

    /// Optimistic retries exhausted
    #[error("Gave up updating job '{job_id}' after {attempts} conflicting attempts")]
    Contention { job_id: JobId, attempts: u32 },

    /// Stored data could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Background store task died
    #[error("Store task failed: {0}")]
    TaskFailed(String),
}

impl StoreError {
    /// Check if the operation may succeed when retried against fresh state
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection failed
    #[error("Failed to connect to Redis at '{url}': {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// Redis operation failed
    #[error("Queue operation failed: {0}")]
    OperationFailed(String),

    /// Message could not be encoded or decoded
    #[error("Failed to serialize/deserialize message: {0}")]
    Serialization(String),

    /// Queue has been closed
    #[error("Queue '{name}' is closed")]
    Closed { name: String },

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Redis(err.to_string())
    }
}

/// Archive build errors
///
/// Every variant means the container itself could not be produced; the
/// caller turns it into Archive state ERROR.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Output file or directory could not be created
    #[error("Failed to create '{path}': {source}")]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing into the container failed
    #[error("Failed to write '{path}': {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    /// Stream compression of the intermediate TAR failed
    #[error("Failed to compress '{path}': {reason}")]
    Compression { path: PathBuf, reason: String },

    /// Moving the finished container into place failed
    #[error("Failed to finalize '{path}': {source}")]
    FinalizeFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Background build task died
    #[error("Build task failed: {0}")]
    TaskFailed(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid archive size settings
    #[error("Invalid archive size: {0}")]
    InvalidArchiveSize(String),

    /// Compression estimate outside [0, 100)
    #[error("Invalid average compression percent {0}: must be in [0, 100)")]
    InvalidCompressionPercent(f64),

    /// Processing threshold not a positive number of hours
    #[error("Invalid processing threshold {0} hours: must be positive")]
    InvalidThreshold(f64),

    /// Invalid regex
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Invalid Redis URL
    #[error("Invalid Redis URL: {0}")]
    InvalidRedisUrl(String),

    /// Invalid output path
    #[error("Invalid output path '{path}': {reason}")]
    InvalidOutputPath { path: PathBuf, reason: String },
}

/// Worker errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Message refers to an archive the job does not have
    #[error("Job '{job_id}' has no archive {archive_id}")]
    ArchiveNotFound { job_id: JobId, archive_id: u32 },

    /// Worker task panicked or was cancelled
    #[error("Worker '{id}' stopped abnormally: {message}")]
    Panicked { id: String, message: String },
}

/// Request-shape errors surfaced to the submitting client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Nothing was named
    #[error("Request names no files")]
    NoFiles,

    /// Everything named was filtered out
    #[error("None of the {rejected} requested files can be archived")]
    NoValidFiles { rejected: usize },

    /// Malformed job identifier
    #[error("Invalid job id '{0}': expected 32 hexadecimal characters")]
    InvalidJobId(String),

    /// Unknown archive type in strict parsing
    #[error("Unknown archive type '{0}'")]
    UnknownArchiveType(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, BundlerError>;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Result type for archive builds
pub type BuildResult<T> = std::result::Result<T, BuildError>;
