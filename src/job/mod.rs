//! Job data model
//!
//! Jobs are the unit of client requests; archives are the unit of work
//! distribution. Each archive carries the file entries written into it.

mod types;

pub use types::{
    Archive, ArchiveState, ArchiveType, FileEntry, FileState, Job, JobId, JobState,
    RollupReport, JOB_ID_LEN,
};
