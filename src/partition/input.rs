//! Input collection
//!
//! Turns the paths named on a request into validated files. Regular files are
//! taken as-is; directories are walked and every file below them is stored
//! relative to the directory's parent, so the directory itself becomes the
//! top level of the archive.

use regex::Regex;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::builder::relativize;
use crate::error::RequestError;
use crate::partition::ValidatedFile;

/// Collect validated files from the named paths.
///
/// Missing, empty and excluded files are skipped with a warning. A request
/// naming nothing fails with [`RequestError::NoFiles`]; a request where every
/// candidate was skipped fails with [`RequestError::NoValidFiles`].
pub fn collect_inputs(
    paths: &[PathBuf],
    exclude_patterns: &[Regex],
) -> Result<Vec<ValidatedFile>, RequestError> {
    if paths.is_empty() {
        return Err(RequestError::NoFiles);
    }

    let mut files = Vec::new();
    let mut rejected = 0usize;

    for path in paths {
        let absolute = match std::path::absolute(path) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                rejected += 1;
                continue;
            }
        };

        if absolute.is_dir() {
            walk_directory(&absolute, exclude_patterns, &mut files, &mut rejected);
        } else {
            match validate_file(&absolute, exclude_patterns) {
                Some(size) => files.push(ValidatedFile::new(absolute, size)),
                None => rejected += 1,
            }
        }
    }

    if files.is_empty() {
        return Err(RequestError::NoValidFiles { rejected });
    }

    tracing::debug!(
        "Collected {} files ({} rejected) from {} paths",
        files.len(),
        rejected,
        paths.len()
    );
    Ok(files)
}

fn walk_directory(
    dir: &Path,
    exclude_patterns: &[Regex],
    files: &mut Vec<ValidatedFile>,
    rejected: &mut usize,
) {
    let base = dir.parent().unwrap_or(dir).to_path_buf();

    let walker = WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_excluded(e.path(), exclude_patterns));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Error walking {}: {}", dir.display(), e);
                *rejected += 1;
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let size = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                tracing::warn!("Skipping {}: {}", entry.path().display(), e);
                *rejected += 1;
                continue;
            }
        };
        if size == 0 {
            tracing::warn!("Skipping empty file {}", entry.path().display());
            *rejected += 1;
            continue;
        }

        let entry_path = relativize(entry.path(), &base);
        files.push(
            ValidatedFile::new(entry.path().to_path_buf(), size)
                .with_entry_path(entry_path.to_string_lossy().to_string()),
        );
    }
}

fn validate_file(path: &Path, exclude_patterns: &[Regex]) -> Option<u64> {
    if is_excluded(path, exclude_patterns) {
        tracing::debug!("Excluded {}", path.display());
        return None;
    }

    match std::fs::metadata(path) {
        Ok(m) if m.is_file() && m.len() > 0 => Some(m.len()),
        Ok(m) if m.is_file() => {
            tracing::warn!("Skipping empty file {}", path.display());
            None
        }
        Ok(_) => {
            tracing::warn!("Skipping {}: not a regular file", path.display());
            None
        }
        Err(e) => {
            tracing::warn!("Skipping {}: {}", path.display(), e);
            None
        }
    }
}

fn is_excluded(path: &Path, exclude_patterns: &[Regex]) -> bool {
    if exclude_patterns.is_empty() {
        return false;
    }
    let text = path.to_string_lossy();
    exclude_patterns.iter().any(|re| re.is_match(&text))
}
