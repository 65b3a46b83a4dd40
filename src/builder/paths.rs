//! Path helpers shared by the container writers

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Stored names in a TAR header must be shorter than this
pub const TAR_NAME_LIMIT: usize = 100;

/// Strip the longest common component prefix of `candidate` and `base`.
///
/// A descendant of `base` yields its path below `base`. Anything else yields
/// what is left of `candidate` after the shared prefix, so the result never
/// climbs above the archive root. Root and drive components are never part of
/// the result.
pub fn relativize(candidate: &Path, base: &Path) -> PathBuf {
    let candidate_parts: Vec<Component<'_>> = candidate.components().collect();
    let common = candidate_parts
        .iter()
        .zip(base.components())
        .take_while(|(c, b)| **c == *b)
        .count();

    candidate_parts[common..]
        .iter()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Name to store a TAR entry under.
///
/// Names of `TAR_NAME_LIMIT` bytes or more are replaced by their base name.
/// A base name that is itself too long is returned unchanged and left to the
/// writer's long-name handling.
pub fn tar_entry_name(entry_path: &str) -> &str {
    if entry_path.len() < TAR_NAME_LIMIT {
        return entry_path;
    }

    let base = entry_path.rsplit('/').next().unwrap_or(entry_path);
    if base.len() >= TAR_NAME_LIMIT {
        tracing::warn!(
            "TAR entry base name is {} bytes, stored with long-name extension: {}",
            base.len(),
            base
        );
    } else {
        tracing::debug!("TAR entry name too long, using base name: {}", entry_path);
    }
    base
}

/// Make `name` unique among `seen` by numbering repeats before the extension
pub fn unique_entry_name(name: &str, seen: &mut HashSet<String>) -> String {
    if seen.insert(name.to_string()) {
        return name.to_string();
    }

    let (dir, file) = match name.rfind('/') {
        Some(idx) => (&name[..=idx], &name[idx + 1..]),
        None => ("", name),
    };
    let (stem, ext) = match file.rfind('.') {
        Some(idx) if idx > 0 => (&file[..idx], &file[idx..]),
        _ => (file, ""),
    };

    let mut n = 1u32;
    loop {
        let candidate = format!("{}{}-{}{}", dir, stem, n, ext);
        if seen.insert(candidate.clone()) {
            tracing::warn!("Duplicate entry name {}, stored as {}", name, candidate);
            return candidate;
        }
        n += 1;
    }
}
