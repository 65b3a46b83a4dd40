//! Compressed TAR writers (GZIP, BZIP2)
//!
//! The stream compressors only see one byte stream, so these formats are
//! built in two phases: a complete TAR is written to an intermediate file,
//! then that file is compressed into the destination. The intermediate is
//! always removed afterwards.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::builder::engine::{finish_file, ContainerWriter};
use crate::builder::tar_format::TarWriter;
use crate::error::{BuildError, BuildResult};
use crate::job::Archive;

/// Stream codec applied to the intermediate TAR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Bzip2,
}

/// Writes a TAR and stream-compresses it
#[derive(Debug, Clone, Copy)]
pub struct CompressedTarWriter {
    codec: Codec,
}

impl CompressedTarWriter {
    /// Create a writer for the given codec
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }
}

/// Path of the intermediate TAR for `dest`
pub fn intermediate_tar_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".tar");
    PathBuf::from(name)
}

impl ContainerWriter for CompressedTarWriter {
    fn write_container(&self, archive: &Archive, dest: &Path) -> BuildResult<Vec<usize>> {
        let intermediate = intermediate_tar_path(dest);

        let result = TarWriter
            .write_container(archive, &intermediate)
            .and_then(|written| {
                compress(&intermediate, dest, self.codec)?;
                Ok(written)
            });

        if let Err(e) = std::fs::remove_file(&intermediate) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    "Failed to remove intermediate {}: {}",
                    intermediate.display(),
                    e
                );
            }
        }

        result
    }
}

fn compress(src: &Path, dest: &Path, codec: Codec) -> BuildResult<()> {
    let compression_failed = |e: io::Error| BuildError::Compression {
        path: dest.to_path_buf(),
        reason: e.to_string(),
    };

    let mut input = BufReader::new(File::open(src).map_err(compression_failed)?);
    let output = File::create(dest).map_err(|source| BuildError::CreateFailed {
        path: dest.to_path_buf(),
        source,
    })?;

    let writer = match codec {
        Codec::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(BufWriter::new(output), flate2::Compression::default());
            io::copy(&mut input, &mut encoder).map_err(compression_failed)?;
            encoder.finish().map_err(compression_failed)?
        }
        Codec::Bzip2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(BufWriter::new(output), bzip2::Compression::default());
            io::copy(&mut input, &mut encoder).map_err(compression_failed)?;
            encoder.finish().map_err(compression_failed)?
        }
    };

    finish_file(writer, dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ArchiveType, FileEntry, JobId};
    use std::io::Read;
    use tempfile::TempDir;

    fn sample_archive(dir: &Path, archive_type: ArchiveType) -> Archive {
        let src = dir.join("input.txt");
        std::fs::write(&src, b"hello compressed world").unwrap();
        let mut archive = Archive::new(JobId::generate(), 0, archive_type);
        archive.add_file(FileEntry::new(src, "greeting/input.txt".into(), 22));
        archive
    }

    fn tar_names<R: Read>(reader: R) -> Vec<String> {
        tar::Archive::new(reader)
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_gzip_contains_tar_and_removes_intermediate() {
        let dir = TempDir::new().unwrap();
        let archive = sample_archive(dir.path(), ArchiveType::Gzip);
        let dest = dir.path().join("out.gzip");

        let written = CompressedTarWriter::new(Codec::Gzip)
            .write_container(&archive, &dest)
            .unwrap();
        assert_eq!(written, vec![0]);
        assert!(!intermediate_tar_path(&dest).exists());

        let decoder = flate2::read::GzDecoder::new(File::open(&dest).unwrap());
        assert_eq!(tar_names(decoder), vec!["greeting/input.txt".to_string()]);
    }

    #[test]
    fn test_bzip2_contains_tar() {
        let dir = TempDir::new().unwrap();
        let archive = sample_archive(dir.path(), ArchiveType::Bzip2);
        let dest = dir.path().join("out.bzip2");

        CompressedTarWriter::new(Codec::Bzip2)
            .write_container(&archive, &dest)
            .unwrap();
        assert!(!intermediate_tar_path(&dest).exists());

        let decoder = bzip2::read::BzDecoder::new(File::open(&dest).unwrap());
        assert_eq!(tar_names(decoder), vec!["greeting/input.txt".to_string()]);
    }
}
