//! TAR container writer

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom};
use std::path::Path;

use crate::builder::engine::{finish_file, open_source, write_failed, ContainerWriter};
use crate::builder::paths::{tar_entry_name, unique_entry_name};
use crate::error::{BuildError, BuildResult};
use crate::job::Archive;

/// Writes archives as uncompressed GNU TAR streams
#[derive(Debug, Default, Clone, Copy)]
pub struct TarWriter;

impl ContainerWriter for TarWriter {
    fn write_container(&self, archive: &Archive, dest: &Path) -> BuildResult<Vec<usize>> {
        let file = File::create(dest).map_err(|source| BuildError::CreateFailed {
            path: dest.to_path_buf(),
            source,
        })?;
        let mut builder = tar::Builder::new(BufWriter::new(file));
        let mut written = Vec::with_capacity(archive.files.len());
        let mut seen = HashSet::new();

        for (index, entry) in archive.files.iter().enumerate() {
            let Some(source) = open_source(entry) else {
                continue;
            };

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(source.len);
            header.set_mode(0o644);
            header.set_mtime(source.mtime);

            let name = unique_entry_name(tar_entry_name(&entry.entry_path), &mut seen);
            let appended = append_sized(&mut builder, &mut header, &name, source.file, source.len)
                .map_err(|e| write_failed(dest, e))?;
            if appended {
                written.push(index);
            } else {
                tracing::warn!(
                    "Skipping {}: file shrank below its recorded {} bytes while being archived",
                    entry.source_path.display(),
                    source.len
                );
            }
        }

        let inner = builder.into_inner().map_err(|e| write_failed(dest, e))?;
        finish_file(inner, dest)?;
        Ok(written)
    }
}

/// Reader that yields exactly `remaining` bytes or reports the source short
struct SizedSource<R> {
    inner: R,
    remaining: u64,
    short: bool,
}

impl<R: Read> Read for SizedSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = self.remaining.min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            self.short = true;
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "source ended before its recorded size",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Append one entry whose header declares `len` bytes.
///
/// A source that runs dry early is dropped: the output is cut back to where
/// the entry started so the stream stays valid. Returns whether the entry was
/// kept.
fn append_sized<R: Read>(
    builder: &mut tar::Builder<BufWriter<File>>,
    header: &mut tar::Header,
    name: &str,
    source: R,
    len: u64,
) -> io::Result<bool> {
    let mark = builder.get_mut().stream_position()?;
    let mut reader = SizedSource {
        inner: source,
        remaining: len,
        short: false,
    };

    match builder.append_data(header, name, &mut reader) {
        Ok(()) => Ok(true),
        Err(_) if reader.short => {
            let out = builder.get_mut();
            out.seek(SeekFrom::Start(mark))?;
            out.get_ref().set_len(mark)?;
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
