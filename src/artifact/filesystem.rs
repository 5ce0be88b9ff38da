//! Filesystem helpers behind the step context's copy primitive.
//!
//! Symlinks are reproduced as links unless the caller asks for them to be
//! dereferenced, in which case the target's contents are copied.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Where a copy of `src` lands when `dst` may be an existing directory.
pub fn copy_destination(src: &Path, dst: &Path) -> PathBuf {
    if dst.is_dir() {
        if let Some(name) = src.file_name() {
            return dst.join(name);
        }
    }
    dst.to_path_buf()
}

/// Copy a single file (or symlink) to `dst`, returning the created path.
pub fn copy_file(src: &Path, dst: &Path, follow_symlinks: bool) -> io::Result<PathBuf> {
    let dst = copy_destination(src, dst);
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() && !follow_symlinks {
        replace_with_symlink(&fs::read_link(src)?, &dst)?;
    } else {
        if dst.is_symlink() {
            fs::remove_file(&dst)?;
        }
        fs::copy(src, &dst)?;
    }
    Ok(dst)
}

/// Recursively copy the directory `src` to `dst`, merging into an existing
/// tree. Returns the root of the copied tree.
pub fn copy_tree(src: &Path, dst: &Path, follow_symlinks: bool) -> io::Result<PathBuf> {
    let dst = copy_destination(src, dst);
    fs::create_dir_all(&dst)?;

    for entry in WalkDir::new(src).follow_links(follow_symlinks).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            replace_with_symlink(&fs::read_link(entry.path())?, &target)?;
        } else {
            if target.is_symlink() {
                fs::remove_file(&target)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(dst)
}

/// Canonical form of an installed path, used to compare paths across runs.
///
/// The parent directory is canonicalized, the final component is kept as
/// is, so a symlink installed as an artifact is not swapped for its target.
/// When the parent no longer exists the nearest existing ancestor is
/// canonicalized and the remaining components are appended.
///
/// # Arguments
///
/// * `path` - Absolute artifact path
///
/// # Example
///
/// ```rust,ignore
/// use bootchain::artifact::filesystem::canonical_install_path;
/// use std::path::Path;
///
/// // With /efi -> /boot/efi:
/// let path = canonical_install_path(Path::new("/efi/EFI/Linux/chimera-A-6.6.1.efi"));
/// assert_eq!(path, Path::new("/boot/efi/EFI/Linux/chimera-A-6.6.1.efi"));
/// ```
pub fn canonical_install_path(path: &Path) -> PathBuf {
    let (Some(mut dir), Some(name)) = (path.parent(), path.file_name()) else {
        return path.to_path_buf();
    };
    let mut tail = vec![name];
    loop {
        if let Ok(real) = fs::canonicalize(dir) {
            return tail.iter().rev().fold(real, |acc, part| acc.join(part));
        }
        match (dir.parent(), dir.file_name()) {
            (Some(up), Some(name)) => {
                tail.push(name);
                dir = up;
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn replace_with_symlink(link_target: &Path, at: &Path) -> io::Result<()> {
    if at.is_symlink() || at.exists() {
        fs::remove_file(at)?;
    }
    symlink(link_target, at)
}
