//! Coordination across nodes
//!
//! - [`RecoveryCoordinator`] repairs work a crashed node left behind
//! - [`Coordinator`] reports system status and retries failed archives

mod manager;
mod recovery;

pub use manager::{Coordinator, JobCounts, SystemStatus, WorkerInfo};
pub use recovery::{RecoveryCoordinator, RecoveryReport};
