//! Entry path normalization
//!
//! Entry paths are the names files are stored under inside a container. They
//! use `/` separators, never start with a separator and are never empty.

use std::path::Path;

/// Name used when neither the entry path nor the source path yields a name
pub const UNNAMED_ENTRY: &str = "unnamed";

/// Normalize a raw entry path.
///
/// Backslashes become `/`. If the path is absolute, the first configured
/// exclusion that matches at a segment boundary is stripped. Empty, `.` and
/// `..` segments are dropped, which also removes any leading separator. When
/// nothing remains the base name of `source_path` is used instead.
///
/// Normalizing an already normalized path returns it unchanged.
pub fn normalize_entry_path(raw: &str, exclusions: &[String], source_path: &Path) -> String {
    let mut path = raw.replace('\\', "/");

    if path.starts_with('/') {
        if let Some(rest) = strip_exclusion(&path, exclusions) {
            path = rest;
        }
    }

    let normalized = join_segments(&path);
    if !normalized.is_empty() {
        return normalized;
    }

    base_name(source_path)
}

/// Base name of a path as an entry name
pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| UNNAMED_ENTRY.to_string())
}

fn strip_exclusion(path: &str, exclusions: &[String]) -> Option<String> {
    for exclusion in exclusions {
        let exclusion = exclusion.replace('\\', "/");
        let trimmed = exclusion.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let prefix = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        };

        if let Some(rest) = path.strip_prefix(prefix.as_str()) {
            if rest.is_empty() || rest.starts_with('/') {
                return Some(rest.to_string());
            }
        }
    }
    None
}

fn join_segments(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect::<Vec<_>>()
        .join("/")
}
