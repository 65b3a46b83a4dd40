//! Archive build orchestration
//!
//! [`ArchiveBuilder::build`] produces the output file of one archive:
//! the container is written to a scratch path unique to the building worker,
//! renamed into place once complete, and followed by its checksum file.
//! Source files that vanished since validation are skipped; anything that
//! prevents the container itself from being written fails the build.

use std::fmt::Display;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::builder::checksum::write_hash_file;
use crate::builder::compressed::{Codec, CompressedTarWriter};
use crate::builder::tar_format::TarWriter;
use crate::builder::zip_format::ZipFormatWriter;
use crate::error::{BuildError, BuildResult};
use crate::job::{Archive, ArchiveType, FileEntry};

/// Marker between an output file name and the worker tag of its scratch file
const SCRATCH_MARKER: &str = ".partial-";

/// Writes the files of an archive into a container at `dest`
pub trait ContainerWriter: Send + Sync {
    /// Write every readable file and return the indices of those written
    fn write_container(&self, archive: &Archive, dest: &Path) -> BuildResult<Vec<usize>>;
}

/// Select the writer for a container format
pub fn container_writer(archive_type: ArchiveType) -> Box<dyn ContainerWriter> {
    match archive_type {
        ArchiveType::Zip => Box::new(ZipFormatWriter),
        ArchiveType::Tar => Box::new(TarWriter),
        ArchiveType::Gzip => Box::new(CompressedTarWriter::new(Codec::Gzip)),
        ArchiveType::Bzip2 => Box::new(CompressedTarWriter::new(Codec::Bzip2)),
    }
}

/// Result of a successful build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Size of the finished container
    pub size_bytes: u64,
    /// Indices into `Archive::files` that were written
    pub written: Vec<usize>,
    /// Source files that could not be read and were left out
    pub skipped: Vec<PathBuf>,
    /// Hex SHA-256 of the container
    pub sha256: String,
}

impl BuildReport {
    /// Whether every file made it into the container
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Builds archive containers on local disk
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    scratch_tag: String,
}

impl ArchiveBuilder {
    /// Create a builder whose scratch files carry `scratch_tag`
    pub fn new(scratch_tag: &str) -> Self {
        let scratch_tag: String = scratch_tag
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        Self { scratch_tag }
    }

    /// Scratch path used while `output` is being written
    pub fn scratch_path(&self, output: &Path) -> PathBuf {
        with_suffix(output, &format!("{}{}", SCRATCH_MARKER, self.scratch_tag))
    }

    /// Build the container of `archive` at its output path
    pub fn build(&self, archive: &Archive) -> BuildResult<BuildReport> {
        let output = archive.output_path.as_path();
        if output.file_name().is_none() {
            return Err(BuildError::CreateFailed {
                path: output.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "archive has no output path"),
            });
        }

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| BuildError::CreateFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let scratch = self.scratch_path(output);
        let writer = container_writer(archive.archive_type);

        let written = match writer.write_container(archive, &scratch) {
            Ok(written) => written,
            Err(e) => {
                remove_if_exists(&scratch);
                return Err(e);
            }
        };

        if let Err(source) = std::fs::rename(&scratch, output) {
            remove_if_exists(&scratch);
            return Err(BuildError::FinalizeFailed {
                path: output.to_path_buf(),
                source,
            });
        }

        let size_bytes = std::fs::metadata(output)
            .map_err(|source| BuildError::FinalizeFailed {
                path: output.to_path_buf(),
                source,
            })?
            .len();

        let hash_scratch = self.scratch_path(&archive.hash_path);
        let sha256 = write_hash_file(output, &archive.hash_path, &hash_scratch).map_err(|e| {
            remove_if_exists(&hash_scratch);
            BuildError::WriteFailed {
                path: archive.hash_path.clone(),
                reason: e.to_string(),
            }
        })?;

        let skipped = archive
            .files
            .iter()
            .enumerate()
            .filter(|(i, _)| !written.contains(i))
            .map(|(_, f)| f.source_path.clone())
            .collect();

        Ok(BuildReport {
            size_bytes,
            written,
            skipped,
            sha256,
        })
    }
}

/// Remove every file a build of `archive` may have left behind.
///
/// Covers the final container, its checksum and scratch files from any
/// worker. Returns the number of files removed.
pub fn remove_outputs(archive: &Archive) -> io::Result<usize> {
    let mut removed = 0;

    for path in [&archive.output_path, &archive.hash_path] {
        if path.file_name().is_none() {
            continue;
        }
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        removed += remove_scratch_files(path)?;
    }

    Ok(removed)
}

fn remove_scratch_files(path: &Path) -> io::Result<usize> {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(0);
    };
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    let prefix = format!("{}{}", name.to_string_lossy(), SCRATCH_MARKER);

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(removed)
}

/// Opened source file ready to be copied into a container
pub(crate) struct SourceFile {
    pub file: File,
    pub len: u64,
    pub mtime: u64,
}

/// Open a source file, or log and return `None` if it is gone or unreadable
pub(crate) fn open_source(entry: &FileEntry) -> Option<SourceFile> {
    let file = match File::open(&entry.source_path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(
                "Skipping {}: {}",
                entry.source_path.display(),
                e
            );
            return None;
        }
    };

    let metadata = match file.metadata() {
        Ok(m) if m.is_file() => m,
        Ok(_) => {
            tracing::warn!("Skipping {}: not a regular file", entry.source_path.display());
            return None;
        }
        Err(e) => {
            tracing::warn!("Skipping {}: {}", entry.source_path.display(), e);
            return None;
        }
    };

    if metadata.len() != entry.size_bytes {
        tracing::debug!(
            "{} changed size since validation ({} -> {})",
            entry.source_path.display(),
            entry.size_bytes,
            metadata.len()
        );
    }

    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Some(SourceFile {
        file,
        len: metadata.len(),
        mtime,
    })
}

/// Flush a buffered container file and sync it to disk
pub(crate) fn finish_file(writer: BufWriter<File>, dest: &Path) -> BuildResult<()> {
    let file = writer
        .into_inner()
        .map_err(|e| write_failed(dest, e.into_error()))?;
    file.sync_all().map_err(|e| write_failed(dest, e))
}

pub(crate) fn write_failed(dest: &Path, err: impl Display) -> BuildError {
    BuildError::WriteFailed {
        path: dest.to_path_buf(),
        reason: err.to_string(),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
