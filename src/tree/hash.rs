// Tree fingerprints.
//
// A tree hash is one SHA-256 over every entry of a snapshot, folded in
// lexical path order. Each entry contributes a tuple whose shape depends on
// the archive major version:
//
//   V3: path, kind, mode & 0o7777, executable, content
//   V2: path, kind, mode & 0o777, content
//
// Content is the file's own SHA-256, the symlink target, or nothing for a
// directory. Variable-length fields are prefixed with their u64le length so
// that no two distinct tuples serialize to the same bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::entry::{EntryKind, FileEntry, TreeError, TreeSnapshot};

// ---------------------------------------------------------------------------
// MajorVersion
// ---------------------------------------------------------------------------

/// Archive format generation. Decides the hash tuple and whether Clone
/// commands may be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum MajorVersion {
    V2 = 2,
    #[default]
    V3 = 3,
}

impl MajorVersion {
    pub const LATEST: MajorVersion = MajorVersion::V3;

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            2 => Some(MajorVersion::V2),
            3 => Some(MajorVersion::V3),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Minor version written by this implementation.
    pub fn latest_minor(self) -> u16 {
        match self {
            MajorVersion::V2 => 3,
            MajorVersion::V3 => 2,
        }
    }

    pub fn supports_clone(self) -> bool {
        self >= MajorVersion::V3
    }

    /// Permission bits that take part in the tree hash.
    pub fn permission_mask(self) -> u16 {
        match self {
            MajorVersion::V2 => 0o777,
            MajorVersion::V3 => 0o7777,
        }
    }
}

impl fmt::Display for MajorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

// ---------------------------------------------------------------------------
// TreeHash
// ---------------------------------------------------------------------------

/// 32-byte tree fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TreeHash(pub [u8; 32]);

impl TreeHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeHash({})", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// FileHashTable
// ---------------------------------------------------------------------------

/// Content hash to the regular files carrying it, in lexical order.
#[derive(Debug, Clone, Default)]
pub struct FileHashTable {
    by_hash: BTreeMap<[u8; 32], Vec<String>>,
}

impl FileHashTable {
    pub fn from_snapshot(snapshot: &TreeSnapshot) -> Self {
        let mut by_hash: BTreeMap<[u8; 32], Vec<String>> = BTreeMap::new();
        // Snapshot iteration is lexical, so every list stays sorted.
        for entry in snapshot.iter().filter(|e| e.is_file()) {
            by_hash
                .entry(entry.content_hash)
                .or_default()
                .push(entry.path.clone());
        }
        Self { by_hash }
    }

    /// All files with this content.
    pub fn paths(&self, hash: &[u8; 32]) -> &[String] {
        self.by_hash.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Lexically-first file with this content.
    pub fn first(&self, hash: &[u8; 32]) -> Option<&str> {
        self.paths(hash).first().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

fn update_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn update_entry(hasher: &mut Sha256, entry: &FileEntry, version: MajorVersion) {
    update_bytes(hasher, entry.path.as_bytes());
    hasher.update([entry.kind.tag()]);
    hasher.update((entry.mode & version.permission_mask()).to_le_bytes());
    if version >= MajorVersion::V3 {
        hasher.update([u8::from(entry.executable)]);
    }
    match entry.kind {
        EntryKind::File => hasher.update(entry.content_hash),
        EntryKind::Symlink => {
            update_bytes(hasher, entry.link_target.as_deref().unwrap_or("").as_bytes())
        }
        EntryKind::Directory => {}
    }
}

/// Fingerprint of an existing snapshot.
pub fn hash_snapshot(snapshot: &TreeSnapshot, version: MajorVersion) -> TreeHash {
    let mut hasher = Sha256::new();
    for entry in snapshot.iter() {
        update_entry(&mut hasher, entry, version);
    }
    TreeHash(hasher.finalize().into())
}

/// Scan `root` and fingerprint it.
pub fn hash_tree(root: &Path, version: MajorVersion) -> Result<TreeHash, TreeError> {
    let snapshot = TreeSnapshot::scan(root)?;
    Ok(hash_snapshot(&snapshot, version))
}

/// Scan `root`, fingerprint it and index its files by content.
pub fn hash_tree_with_table(
    root: &Path,
    version: MajorVersion,
) -> Result<(TreeSnapshot, TreeHash, FileHashTable), TreeError> {
    let snapshot = TreeSnapshot::scan(root)?;
    let hash = hash_snapshot(&snapshot, version);
    let table = FileHashTable::from_snapshot(&snapshot);
    Ok((snapshot, hash, table))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree(files: &[(&str, &[u8])]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, data) in files {
            let full = dir.path().join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(full, data).unwrap();
        }
        dir
    }

    #[test]
    fn identical_trees_hash_equal() {
        let a = tree(&[("x/a.txt", b"one"), ("b.txt", b"two")]);
        let b = tree(&[("b.txt", b"two"), ("x/a.txt", b"one")]);
        for v in [MajorVersion::V2, MajorVersion::V3] {
            assert_eq!(
                hash_tree(a.path(), v).unwrap(),
                hash_tree(b.path(), v).unwrap()
            );
        }
    }

    #[test]
    fn content_and_name_changes_alter_hash() {
        let base = tree(&[("a.txt", b"one")]);
        let content = tree(&[("a.txt", b"One")]);
        let renamed = tree(&[("b.txt", b"one")]);
        let h = |d: &tempfile::TempDir| hash_tree(d.path(), MajorVersion::V3).unwrap();
        assert_ne!(h(&base), h(&content));
        assert_ne!(h(&base), h(&renamed));
    }

    #[test]
    fn versions_produce_different_hashes() {
        let dir = tree(&[("a.txt", b"one")]);
        assert_ne!(
            hash_tree(dir.path(), MajorVersion::V2).unwrap(),
            hash_tree(dir.path(), MajorVersion::V3).unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn v2_ignores_special_permission_bits() {
        use std::os::unix::fs::PermissionsExt;

        let a = tree(&[("d/f", b"data")]);
        let b = tree(&[("d/f", b"data")]);
        fs::set_permissions(a.path().join("d"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(b.path().join("d"), fs::Permissions::from_mode(0o1755)).unwrap();
        assert_eq!(
            hash_tree(a.path(), MajorVersion::V2).unwrap(),
            hash_tree(b.path(), MajorVersion::V2).unwrap()
        );
        assert_ne!(
            hash_tree(a.path(), MajorVersion::V3).unwrap(),
            hash_tree(b.path(), MajorVersion::V3).unwrap()
        );
    }

    #[test]
    fn empty_directories_count() {
        let a = tree(&[("f", b"x")]);
        let b = tree(&[("f", b"x")]);
        fs::create_dir(b.path().join("empty")).unwrap();
        assert_ne!(
            hash_tree(a.path(), MajorVersion::V3).unwrap(),
            hash_tree(b.path(), MajorVersion::V3).unwrap()
        );
    }

    #[test]
    fn file_table_groups_by_content() {
        let dir = tree(&[("c", b"same"), ("a", b"same"), ("b", b"other")]);
        let (snapshot, _, table) = hash_tree_with_table(dir.path(), MajorVersion::V3).unwrap();
        let same = snapshot.get("a").unwrap().content_hash;
        assert_eq!(table.paths(&same), ["a", "c"]);
        assert_eq!(table.first(&same), Some("a"));
        assert_eq!(table.len(), 2);
        assert!(table.paths(&[0; 32]).is_empty());
    }

    #[test]
    fn major_version_parsing() {
        assert_eq!(MajorVersion::from_u16(2), Some(MajorVersion::V2));
        assert_eq!(MajorVersion::from_u16(3), Some(MajorVersion::V3));
        assert_eq!(MajorVersion::from_u16(1), None);
        assert_eq!(MajorVersion::default(), MajorVersion::LATEST);
        assert!(!MajorVersion::V2.supports_clone());
    }
}
