//! Structural clean-up of a freshly synced problem directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Files the cache keeps next to the problem data.
pub const BOOKKEEPING: &[&str] = &["etags", "etags.tmp", "lastUsage"];

const LEGACY_CONFIG: &str = "config.ini";

/// Directory the plan loader should treat as the data root: a lone
/// top-level directory is an archive wrapper and is looked through.
pub fn data_root(dir: &Path) -> PathBuf {
    match content_entries(dir) {
        Ok(entries) if entries.len() == 1 && entries[0].is_dir() => entries[0].clone(),
        _ => dir.to_path_buf(),
    }
}

/// Normalize legacy layouts in place. Returns the number of renames
/// performed; running it again on the result performs none.
pub fn normalize(dir: &Path) -> io::Result<usize> {
    let root = data_root(dir);
    let entries = content_entries(&root)?;
    let mut renamed = 0;

    let Some(config) = entries.iter().find(|p| has_name_ignore_case(p, LEGACY_CONFIG)) else {
        return Ok(0);
    };
    renamed += move_into(config, &root.join(LEGACY_CONFIG))?;

    for name in ["input", "output"] {
        let Some(sub) = entries
            .iter()
            .find(|p| p.is_dir() && has_name_ignore_case(p, name))
        else {
            continue;
        };
        let target = root.join(name);
        renamed += move_into(sub, &target)?;
        if target.is_dir() {
            renamed += lowercase_children(&target)?;
        }
    }

    if renamed > 0 {
        debug!(root = %root.display(), renamed, "normalized legacy test data layout");
    }
    Ok(renamed)
}

/// Where the remote file `name` currently lives: where it was
/// downloaded, or where normalization moved it.
pub fn resolve(dir: &Path, name: &str) -> Option<PathBuf> {
    let as_named = dir.join(name);
    if as_named.exists() {
        return Some(as_named);
    }
    let lower = name.to_lowercase();
    if lower == name {
        return None;
    }
    let lowered = dir.join(&lower);
    if lowered.exists() {
        return Some(lowered);
    }
    // Wrapper directory names keep their casing.
    match (name.split_once('/'), lower.split_once('/')) {
        (Some((wrapper, _)), Some((_, rest))) => {
            Some(dir.join(wrapper).join(rest)).filter(|p| p.exists())
        }
        _ => None,
    }
}

fn lowercase_children(dir: &Path) -> io::Result<usize> {
    let mut renamed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let lower = name.to_lowercase();
        if lower != name {
            renamed += move_into(&path, &dir.join(lower))?;
        }
    }
    Ok(renamed)
}

/// Move `from` to `to`. A directory is merged into an existing one
/// entry by entry; a file replaces an existing file, since anything not
/// yet normalized is the fresher download. Returns the number of moves.
fn move_into(from: &Path, to: &Path) -> io::Result<usize> {
    if from == to {
        return Ok(0);
    }
    if !to.exists() {
        fs::rename(from, to)?;
        return Ok(1);
    }
    match (from.is_dir(), to.is_dir()) {
        (true, true) => {
            let mut moved = 0;
            for entry in fs::read_dir(from)? {
                let entry = entry?;
                moved += move_into(&entry.path(), &to.join(entry.file_name()))?;
            }
            fs::remove_dir(from)?;
            Ok(moved)
        }
        (false, false) => {
            fs::rename(from, to)?;
            Ok(1)
        }
        _ => {
            warn!(
                from = %from.display(),
                to = %to.display(),
                "cannot merge a file with a directory, skipping"
            );
            Ok(0)
        }
    }
}

fn has_name_ignore_case(path: &Path, name: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.eq_ignore_ascii_case(name))
}

fn content_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if BOOKKEEPING.iter().any(|b| name.as_os_str() == *b) {
            continue;
        }
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}
