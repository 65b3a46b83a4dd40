//! Archive construction
//!
//! Streams the files of one archive into a ZIP, TAR, GZIP or BZIP2 container
//! on local disk and writes its SHA-256 checksum file next to it.

mod checksum;
mod compressed;
mod engine;
mod paths;
mod tar_format;
mod zip_format;

pub use checksum::{compute_file_sha256, write_hash_file};
pub use compressed::intermediate_tar_path;
pub use engine::{container_writer, remove_outputs, ArchiveBuilder, BuildReport, ContainerWriter};
pub use paths::{relativize, tar_entry_name, unique_entry_name, TAR_NAME_LIMIT};
