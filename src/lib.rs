//! archive-bundler - Distributed archive bundler
//!
//! Bundles large file sets into size-bounded, downloadable archives and
//! builds them across a cluster of worker nodes.
//!
//! # Architecture
//!
//! ## Submission
//! - Validates the requested files
//! - Partitions them greedily into archives of a target compressed size
//! - Persists the job and queues one build message per archive
//!
//! ## Building (Workers)
//! - Workers on any node pull build messages from a Redis stream
//! - Each archive is streamed into a ZIP, TAR, GZIP or BZIP2 container
//!   and announced on the completion queue
//!
//! ## Aggregation
//! - Completions are folded into job rollups with versioned updates
//! - A job becomes COMPLETE when its last archive does
//!
//! ## Recovery
//! - Every worker start sweeps invalid jobs, reconciles stale finished jobs
//!   and re-dispatches archives orphaned by a crash of this node

pub mod aggregator;
pub mod builder;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod partition;
pub mod queue;
pub mod store;
pub mod submit;
pub mod worker;

pub use config::{CliArgs, Command};
pub use error::{BundlerError, Result};
pub use job::{Archive, ArchiveState, ArchiveType, Job, JobId, JobState};
