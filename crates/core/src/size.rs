use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::Result;

/// Recursive size of the regular files under `path`, without following symlinks.
///
/// A missing path measures `0`. Entries that cannot be read are skipped, so the
/// result is a lower bound when parts of the tree are unreadable.
pub fn calculate_size(path: &Path) -> u64 {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return 0,
    };
    if !meta.is_dir() {
        return if meta.is_file() { meta.len() } else { 0 };
    }

    let mut total = 0u64;
    let mut unreadable = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => {
                unreadable += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(m) => total = total.saturating_add(m.len()),
            Err(_) => unreadable += 1,
        }
    }

    if unreadable > 0 {
        debug!(
            event = "size.partial",
            path = %path.display(),
            unreadable,
            "size.partial"
        );
    }
    total
}

/// [`calculate_size`] on the blocking pool.
pub async fn measure(path: PathBuf) -> Result<u64> {
    Ok(tokio::task::spawn_blocking(move || calculate_size(&path)).await?)
}
