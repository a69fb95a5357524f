// Filesystem primitives used while applying a delta.
//
// Symlinks are always handled as links: copies recreate them, removals
// unlink them, and permission changes never follow them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::tree::entry::permission_bits;

/// Recursively copy `src` into the not-yet-existing directory `dst`,
/// preserving file permissions and symlinks.
///
/// Directories are left writable so the copy can still be edited. Their
/// original modes are returned, parents before children, keyed by path
/// under `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<Vec<(PathBuf, u16)>> {
    fs::create_dir(dst)?;
    let mut dir_modes = Vec::new();
    for item in WalkDir::new(src).follow_links(false) {
        let item = item.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| io::Error::other("filesystem loop"))
        })?;
        let rel = item
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = item.file_type();
        if file_type.is_symlink() {
            let link = fs::read_link(item.path())?;
            create_symlink(&link, &target)?;
        } else if file_type.is_dir() {
            if item.depth() > 0 {
                fs::create_dir(&target)?;
            }
            let meta = fs::metadata(item.path())?;
            dir_modes.push((target, permission_bits(&meta)));
        } else {
            fs::copy(item.path(), &target)?;
        }
    }
    Ok(dir_modes)
}

/// Remove whatever is at `path`: file, symlink or directory tree.
/// A missing path is not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            make_writable_tree(path)?;
            fs::remove_dir_all(path)
        }
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// True if anything, even a dangling symlink, exists at `path`.
pub fn exists_no_follow(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

pub fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

#[cfg(unix)]
fn make_writable_tree(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    for item in WalkDir::new(path).follow_links(false) {
        let item = item.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| io::Error::other("filesystem loop"))
        })?;
        if item.file_type().is_dir() {
            let mode = fs::metadata(item.path())?.permissions().mode();
            if mode & 0o700 != 0o700 {
                fs::set_permissions(item.path(), fs::Permissions::from_mode(mode | 0o700))?;
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_writable_tree(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Apply permission bits to a file or directory. Symlinks are left alone.
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u16) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if fs::symlink_metadata(path)?.file_type().is_symlink() {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(u32::from(mode & 0o7777)))
}

/// Apply permission bits to a file or directory. Only the owner write bit
/// maps onto this platform.
#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u16) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = meta.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
}

#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(not(any(unix, windows)))]
pub fn create_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
