//! Copy untracked directories (env folders, dependency caches) into a
//! freshly created worktree.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Copy each of `dirs` (relative to `source_root`) into `dest_root`.
///
/// Files already present at the destination are left alone. A missing source
/// directory is logged and skipped. Returns the number of files copied.
pub fn copy_dirs(source_root: &Path, dest_root: &Path, dirs: &[String]) -> Result<usize> {
    let mut copied = 0;
    for rel in dirs {
        let source = source_root.join(rel);
        if !source.exists() {
            warn!(dir = %rel, "copy_dirs source does not exist, skipping");
            continue;
        }
        copied += copy_tree(&source, &dest_root.join(rel))
            .with_context(|| format!("Failed to copy '{}' into worktree", rel))?;
    }
    Ok(copied)
}

fn copy_tree(source: &Path, dest: &Path) -> Result<usize> {
    if source.is_file() {
        return copy_file(source, dest).map(usize::from);
    }

    let mut copied = 0;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .context("walkdir yielded a path outside its root")?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if file_type.is_file() && copy_file(entry.path(), &target)? {
            copied += 1;
        } else if file_type.is_symlink() {
            debug!(path = %entry.path().display(), "skipping symlink");
        }
    }
    Ok(copied)
}

/// Returns `true` when the file was copied, `false` when it already existed.
fn copy_file(source: &Path, target: &Path) -> Result<bool> {
    if target.exists() {
        return Ok(false);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::copy(source, target).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            source.display(),
            target.display()
        )
    })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_copies_nested_tree() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir_all(src.path().join(".env.d/nested")).unwrap();
        fs::write(src.path().join(".env.d/a.env"), "A=1").unwrap();
        fs::write(src.path().join(".env.d/nested/b.env"), "B=2").unwrap();

        let n = copy_dirs(src.path(), dst.path(), &[".env.d".to_string()]).unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            fs::read_to_string(dst.path().join(".env.d/nested/b.env")).unwrap(),
            "B=2"
        );
    }

    #[test]
    fn test_existing_files_are_not_overwritten() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir_all(src.path().join("cfg")).unwrap();
        fs::write(src.path().join("cfg/x"), "new").unwrap();
        fs::create_dir_all(dst.path().join("cfg")).unwrap();
        fs::write(dst.path().join("cfg/x"), "old").unwrap();

        let n = copy_dirs(src.path(), dst.path(), &["cfg".to_string()]).unwrap();
        assert_eq!(n, 0);
        assert_eq!(fs::read_to_string(dst.path().join("cfg/x")).unwrap(), "old");
    }

    #[test]
    fn test_missing_source_is_skipped() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let n = copy_dirs(src.path(), dst.path(), &["absent".to_string()]).unwrap();
        assert_eq!(n, 0);
    }
}
