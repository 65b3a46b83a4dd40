//! Partitioning of validated files into size-bounded archives
//!
//! - [`collect_inputs`] turns request paths into validated files
//! - [`ArchivePartitioner`] packs them greedily into archives
//! - [`normalize_entry_path`] produces the names stored inside containers

mod entry_path;
mod input;
mod partitioner;

pub use entry_path::{base_name, normalize_entry_path, UNNAMED_ENTRY};
pub use input::collect_inputs;
pub use partitioner::{
    ArchiveNaming, ArchivePartitioner, PartitionConfig, ValidatedFile,
    DEFAULT_ARCHIVE_SIZE_MB, DEFAULT_AVERAGE_COMPRESSION_PERCENT, DEFAULT_MAX_ARCHIVE_SIZE_MB,
    DEFAULT_MIN_ARCHIVE_SIZE_MB, HASH_EXTENSION,
};
