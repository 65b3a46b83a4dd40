//! SHA-256 checksum files for built archives

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

const READ_BUF_SIZE: usize = 256 * 1024;

/// Compute the hex-encoded SHA-256 digest of a file
pub fn compute_file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Write `<hex>  <file name>` for `archive_path` to `hash_path`.
///
/// The line is written to `scratch` first and renamed into place.
pub fn write_hash_file(archive_path: &Path, hash_path: &Path, scratch: &Path) -> io::Result<String> {
    let digest = compute_file_sha256(archive_path)?;
    let name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut out = File::create(scratch)?;
    writeln!(out, "{}  {}", digest, name)?;
    out.sync_all()?;
    drop(out);

    std::fs::rename(scratch, hash_path)?;
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            compute_file_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_file_format() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("job_0.zip");
        std::fs::write(&archive, b"abc").unwrap();
        let hash = dir.path().join("job_0.sha256");
        let scratch = dir.path().join("job_0.sha256.partial");

        let digest = write_hash_file(&archive, &hash, &scratch).unwrap();
        let content = std::fs::read_to_string(&hash).unwrap();
        assert_eq!(content, format!("{}  job_0.zip\n", digest));
        assert!(!scratch.exists());
    }
}
