//! Job aggregation
//!
//! Consumes completion messages and folds each one into its job's rollups,
//! moving the job to COMPLETE when its last archive finishes.

mod handler;

pub use handler::{AggregateOutcome, AggregatorStats, JobAggregator};
