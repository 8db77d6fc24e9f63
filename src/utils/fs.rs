//! Filesystem helpers.

use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::StoreError;

/// Recursively copies `src` into `dst`, creating `dst` and any parents.
///
/// Symlinks are followed, so the copy contains regular files only.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dst)?;

    for entry in WalkDir::new(src).follow_links(true).min_depth(1) {
        let entry = entry.map_err(|e| StoreError::Copy {
            src: src.to_path_buf(),
            reason: e.to_string(),
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| StoreError::Copy {
                src: entry.path().to_path_buf(),
                reason: e.to_string(),
            })?;
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}
