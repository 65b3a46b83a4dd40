//! Distributed execution of archive builds
//!
//! The [`WorkDispatcher`] turns a job into one build request per archive;
//! [`ArchiveWorker`] loops on any node consume those requests, build the
//! archives and announce each result on the completion queue.

mod dispatcher;
mod processor;

pub use dispatcher::WorkDispatcher;
pub use processor::{ArchiveWorker, ProcessOutcome, WorkerProgress, WorkerStats};
