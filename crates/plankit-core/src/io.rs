use crate::error::Result;
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Readers see either the previous content or the full new content, never a mix.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Recreate the symlink at `from` as `to`, pointing at the same target.
/// An existing entry at `to` is replaced.
pub fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let link_target = std::fs::read_link(from)?;
    if to.symlink_metadata().is_ok() {
        std::fs::remove_file(to)?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(&link_target, to)?;
    #[cfg(windows)]
    {
        let resolved = from.parent().unwrap_or(Path::new(".")).join(&link_target);
        if resolved.is_dir() {
            std::os::windows::fs::symlink_dir(&link_target, to)?;
        } else {
            std::os::windows::fs::symlink_file(&link_target, to)?;
        }
    }
    Ok(())
}

/// Recursively copy `src` into `dst`, skipping every entry whose path relative
/// to `src` matches `skip`. Returns the number of files copied, symlinks
/// included.
///
/// Symlinks are recreated as links, never followed. `dst` is created if
/// missing; existing files in it are overwritten.
pub fn copy_tree<F>(src: &Path, dst: &Path, skip: F) -> Result<u64>
where
    F: Fn(&Path) -> bool,
{
    std::fs::create_dir_all(dst)?;

    let mut copied = 0_u64;
    let mut queue: VecDeque<(PathBuf, PathBuf)> = VecDeque::new();
    queue.push_back((src.to_path_buf(), dst.to_path_buf()));

    while let Some((from_dir, to_dir)) = queue.pop_front() {
        for entry in std::fs::read_dir(&from_dir)? {
            let entry = entry?;
            let from_path = entry.path();
            let relative = from_path.strip_prefix(src).unwrap_or(&from_path);
            if skip(relative) {
                continue;
            }
            let to_path = to_dir.join(entry.file_name());
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                std::fs::create_dir_all(&to_path)?;
                queue.push_back((from_path, to_path));
            } else if file_type.is_symlink() {
                copy_symlink(&from_path, &to_path)?;
                copied += 1;
            } else if file_type.is_file() {
                std::fs::copy(&from_path, &to_path)?;
                copied += 1;
            }
        }
    }

    Ok(copied)
}

/// Recursively copy `src` into `dst` with nothing skipped.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<u64> {
    copy_tree(src, dst, |_| false)
}

/// List every regular file and symlink under `root`, as paths relative to
/// `root`, sorted. Symlinked directories are not descended into.
pub fn list_files<F>(root: &Path, skip: F) -> Result<Vec<PathBuf>>
where
    F: Fn(&Path) -> bool,
{
    let mut files = Vec::new();
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            if skip(&relative) {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                queue.push_back(path);
            } else if file_type.is_file() || file_type.is_symlink() {
                files.push(relative);
            }
        }
    }

    files.sort();
    Ok(files)
}
