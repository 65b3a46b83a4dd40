//! ZIP container writer

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::builder::engine::{finish_file, open_source, write_failed, ContainerWriter};
use crate::builder::paths::unique_entry_name;
use crate::error::{BuildError, BuildResult};
use crate::job::Archive;

/// Entries at or above this size need ZIP64 headers
const ZIP64_THRESHOLD: u64 = 0xFFFF_FFFF;

/// Writes archives as deflated ZIP files
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipFormatWriter;

impl ContainerWriter for ZipFormatWriter {
    fn write_container(&self, archive: &Archive, dest: &Path) -> BuildResult<Vec<usize>> {
        let file = File::create(dest).map_err(|source| BuildError::CreateFailed {
            path: dest.to_path_buf(),
            source,
        })?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let mut seen = HashSet::with_capacity(archive.files.len());
        let mut written = Vec::with_capacity(archive.files.len());

        for (index, entry) in archive.files.iter().enumerate() {
            let Some(source) = open_source(entry) else {
                continue;
            };

            let options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(0o644)
                .large_file(source.len >= ZIP64_THRESHOLD);

            let name = unique_entry_name(&entry.entry_path, &mut seen);
            zip.start_file(name, options)
                .map_err(|e| write_failed(dest, e))?;
            io::copy(&mut source.file.take(source.len), &mut zip)
                .map_err(|e| write_failed(dest, e))?;
            written.push(index);
        }

        let inner = zip.finish().map_err(|e| write_failed(dest, e))?;
        finish_file(inner, dest)?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ArchiveType, FileEntry, JobId};
    use tempfile::TempDir;

    #[test]
    fn test_zip_round_trip_with_duplicate_names() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"first").unwrap();
        std::fs::write(&b, b"second").unwrap();

        let mut archive = Archive::new(JobId::generate(), 0, ArchiveType::Zip);
        archive.add_file(FileEntry::new(a, "docs/note.txt".into(), 5));
        archive.add_file(FileEntry::new(b, "docs/note.txt".into(), 6));

        let dest = dir.path().join("out.zip");
        let written = ZipFormatWriter.write_container(&archive, &dest).unwrap();
        assert_eq!(written, vec![0, 1]);

        let mut zip = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert_eq!(zip.len(), 2);

        let mut content = String::new();
        zip.by_name("docs/note-1.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "second");
    }
}
