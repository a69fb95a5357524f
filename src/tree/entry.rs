// Directory snapshots.
//
// A snapshot is taken once per operation: every entry below the root is
// recorded with its kind, permission bits and content fingerprint, keyed by
// its forward-slash relative path. Symlinks are never followed.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

/// Permission bits recorded for every symlink; link modes are not portable.
pub const SYMLINK_MODE: u16 = 0o777;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// An entry could not be listed, stat'ed or read.
    #[error("cannot read {path}: {source}")]
    UnreadableEntry {
        path: String,
        #[source]
        source: io::Error,
    },
    /// The snapshot root is missing or not a directory.
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    /// A path or symlink target is not valid UTF-8.
    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),
    /// Sockets, FIFOs and device nodes cannot be represented.
    #[error("unsupported file type at {0}")]
    UnsupportedType(String),
}

fn unreadable(path: impl Into<String>, source: io::Error) -> TreeError {
    TreeError::UnreadableEntry {
        path: path.into(),
        source,
    }
}

// ---------------------------------------------------------------------------
// FileEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    /// Stable tag mixed into tree hashes.
    pub fn tag(self) -> u8 {
        match self {
            EntryKind::File => b'f',
            EntryKind::Directory => b'd',
            EntryKind::Symlink => b'l',
        }
    }

    /// `S_IFMT` bits stored with extracted entries.
    pub fn type_bits(self) -> u16 {
        match self {
            EntryKind::File => 0o100000,
            EntryKind::Directory => 0o040000,
            EntryKind::Symlink => 0o120000,
        }
    }

    /// Inverse of [`EntryKind::type_bits`].
    pub fn from_mode(mode: u16) -> Option<Self> {
        match mode & 0o170000 {
            0o100000 => Some(EntryKind::File),
            0o040000 => Some(EntryKind::Directory),
            0o120000 => Some(EntryKind::Symlink),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
            EntryKind::Symlink => "symlink",
        })
    }
}

/// One entry of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative, forward-slash separated.
    pub path: String,
    pub kind: EntryKind,
    /// Permission bits (`0o7777`).
    pub mode: u16,
    pub executable: bool,
    /// File length; zero for directories, target length for symlinks.
    pub size: u64,
    /// SHA-256 of the contents for regular files, zero otherwise.
    pub content_hash: [u8; 32],
    pub link_target: Option<String>,
}

impl FileEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }
}

// ---------------------------------------------------------------------------
// TreeSnapshot
// ---------------------------------------------------------------------------

/// Every entry below a root, ordered by path bytes.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    root: PathBuf,
    entries: BTreeMap<String, FileEntry>,
}

impl TreeSnapshot {
    /// Walk `root` and fingerprint every entry.
    pub fn scan(root: &Path) -> Result<Self, TreeError> {
        let meta = fs::metadata(root).map_err(|e| unreadable(root.display().to_string(), e))?;
        if !meta.is_dir() {
            return Err(TreeError::NotADirectory(root.to_path_buf()));
        }

        let mut entries = BTreeMap::new();
        for item in WalkDir::new(root).follow_links(false).min_depth(1) {
            let item = item.map_err(|e| {
                let path = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| root.display().to_string());
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::other("filesystem loop"));
                unreadable(path, source)
            })?;
            let rel = relative_path(root, item.path())?;
            let entry = scan_entry(item.path(), rel)?;
            entries.insert(entry.path.clone(), entry);
        }

        log::debug!("scanned {} entries under {}", entries.len(), root.display());
        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Entries in lexical path order.
    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Absolute location of a relative snapshot path.
    pub fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Sum of regular file sizes.
    pub fn total_file_size(&self) -> u64 {
        self.iter().filter(|e| e.is_file()).map(|e| e.size).sum()
    }
}

/// Convert `path` below `root` to a forward-slash relative string.
fn relative_path(root: &Path, path: &Path) -> Result<String, TreeError> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| TreeError::NonUtf8Path(path.to_path_buf()))?;
    let mut out = String::new();
    for component in rel.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| TreeError::NonUtf8Path(path.to_path_buf()))?;
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(part);
    }
    Ok(out)
}

fn scan_entry(full: &Path, rel: String) -> Result<FileEntry, TreeError> {
    let meta = fs::symlink_metadata(full).map_err(|e| unreadable(rel.clone(), e))?;
    let file_type = meta.file_type();
    let mode = if file_type.is_symlink() {
        SYMLINK_MODE
    } else {
        permission_bits(&meta)
    };

    if file_type.is_symlink() {
        let target = fs::read_link(full).map_err(|e| unreadable(rel.clone(), e))?;
        let target = target
            .to_str()
            .ok_or_else(|| TreeError::NonUtf8Path(full.to_path_buf()))?
            .to_owned();
        Ok(FileEntry {
            path: rel,
            kind: EntryKind::Symlink,
            mode,
            executable: false,
            size: target.len() as u64,
            content_hash: [0; 32],
            link_target: Some(target),
        })
    } else if file_type.is_dir() {
        Ok(FileEntry {
            path: rel,
            kind: EntryKind::Directory,
            mode,
            executable: false,
            size: 0,
            content_hash: [0; 32],
            link_target: None,
        })
    } else if file_type.is_file() {
        let content_hash = hash_file(full).map_err(|e| unreadable(rel.clone(), e))?;
        Ok(FileEntry {
            path: rel,
            kind: EntryKind::File,
            mode,
            executable: mode & 0o111 != 0,
            size: meta.len(),
            content_hash,
            link_target: None,
        })
    } else {
        Err(TreeError::UnsupportedType(rel))
    }
}

/// Streaming SHA-256 of a file.
pub fn hash_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut reader = BufReader::with_capacity(BUF_SIZE, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(unix)]
pub(crate) fn permission_bits(meta: &fs::Metadata) -> u16 {
    use std::os::unix::fs::PermissionsExt;
    (meta.permissions().mode() & 0o7777) as u16
}

#[cfg(not(unix))]
pub(crate) fn permission_bits(meta: &fs::Metadata) -> u16 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_records_kinds_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/a.txt"), b"alpha").unwrap();
        fs::write(dir.path().join("b.bin"), b"").unwrap();

        let snap = TreeSnapshot::scan(dir.path()).unwrap();
        let paths: Vec<_> = snap.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["b.bin", "sub", "sub/a.txt"]);

        let a = snap.get("sub/a.txt").unwrap();
        assert!(a.is_file());
        assert_eq!(a.size, 5);
        assert_eq!(a.content_hash, <[u8; 32]>::from(Sha256::digest(b"alpha")));
        assert!(snap.get("sub").unwrap().is_dir());
        assert_eq!(snap.total_file_size(), 5);
    }

    #[cfg(unix)]
    #[test]
    fn scan_keeps_symlinks_and_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tool"), b"#!/bin/sh\n").unwrap();
        fs::set_permissions(dir.path().join("tool"), fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("tool", dir.path().join("link")).unwrap();

        let snap = TreeSnapshot::scan(dir.path()).unwrap();
        let tool = snap.get("tool").unwrap();
        assert_eq!(tool.mode, 0o755);
        assert!(tool.executable);
        let link = snap.get("link").unwrap();
        assert!(link.is_symlink());
        assert_eq!(link.link_target.as_deref(), Some("tool"));
        assert_eq!(link.mode, SYMLINK_MODE);
    }

    #[test]
    fn scan_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = TreeSnapshot::scan(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, TreeError::UnreadableEntry { .. }));

        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            TreeSnapshot::scan(&file),
            Err(TreeError::NotADirectory(_))
        ));
    }

    #[test]
    fn type_bits_roundtrip() {
        for kind in [EntryKind::File, EntryKind::Directory, EntryKind::Symlink] {
            assert_eq!(EntryKind::from_mode(kind.type_bits() | 0o644), Some(kind));
        }
        assert_eq!(EntryKind::from_mode(0o644), None);
    }
}
