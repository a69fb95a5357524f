// Delta commands and the archive path table.
//
// A command pairs a relative path with a set of attribute flags. The flags
// byte is stored verbatim in the archive; zero is reserved as the end marker
// of the command stream.

use std::collections::HashSet;
use std::path::PathBuf;

use bitflags::bitflags;

use crate::bsdiff::DiffRecord;

bitflags! {
    /// Operations applied to one path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandFlags: u8 {
        /// Remove whatever exists at the path.
        const DELETE = 0x01;
        /// Create the entry from data stored in the archive.
        const EXTRACT = 0x02;
        /// Change permission bits only.
        const MODIFY_PERMISSIONS = 0x04;
        /// Rebuild a regular file from its before version and a diff.
        const BINARY_DIFF = 0x08;
        /// Copy a regular file from another before path.
        const CLONE = 0x10;
    }
}

impl CommandFlags {
    /// Check the combination rules every command must obey.
    pub fn is_valid(self) -> bool {
        if self.is_empty() || CommandFlags::from_bits(self.bits()).is_none() {
            return false;
        }
        if self.contains(Self::DELETE | Self::BINARY_DIFF) {
            return false;
        }
        if self.contains(Self::CLONE) && self.intersects(Self::EXTRACT | Self::BINARY_DIFF) {
            return false;
        }
        if self.contains(Self::EXTRACT) && self.contains(Self::BINARY_DIFF) {
            return false;
        }
        true
    }

    /// True when the command carries a 16-bit mode field.
    pub fn has_mode(self) -> bool {
        self.intersects(Self::EXTRACT | Self::MODIFY_PERMISSIONS | Self::CLONE)
    }

    /// Short human label used in logs and `info` listings.
    pub fn describe(self) -> String {
        const NAMES: [(CommandFlags, &str); 5] = [
            (CommandFlags::DELETE, "delete"),
            (CommandFlags::EXTRACT, "extract"),
            (CommandFlags::CLONE, "clone"),
            (CommandFlags::BINARY_DIFF, "diff"),
            (CommandFlags::MODIFY_PERMISSIONS, "chmod"),
        ];
        NAMES
            .iter()
            .filter(|(f, _)| self.contains(*f))
            .map(|(_, n)| *n)
            .collect::<Vec<_>>()
            .join("+")
    }
}

/// Data carried by a command besides its flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Delete, ModifyPermissions, Clone or directory Extract.
    None,
    /// Regular file streamed from disk at write time.
    File(PathBuf),
    /// Regular file contents held in memory.
    Inline(Vec<u8>),
    /// Symlink target.
    Link(String),
    /// Binary diff against the before version of the same path.
    Diff(DiffRecord),
}

/// One entry of the command list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub path: String,
    pub flags: CommandFlags,
    /// Full mode (type bits included) for Extract; permission bits otherwise.
    pub mode: u16,
    pub clone_source: Option<String>,
    pub payload: Payload,
}

impl Command {
    pub fn new(path: impl Into<String>, flags: CommandFlags) -> Self {
        Self {
            path: path.into(),
            flags,
            mode: 0,
            clone_source: None,
            payload: Payload::None,
        }
    }

    pub fn with_mode(mut self, mode: u16) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_clone_source(mut self, source: impl Into<String>) -> Self {
        self.clone_source = Some(source.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// PathTable
// ---------------------------------------------------------------------------

/// Paths referenced by an archive: one per command, in command order,
/// followed by clone sources that have no command of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTable {
    paths: Vec<String>,
    command_count: usize,
}

impl PathTable {
    /// Build the table for `commands`.
    ///
    /// Returns `None` if two commands share a path.
    pub fn for_commands(commands: &[Command]) -> Option<Self> {
        let mut seen = HashSet::with_capacity(commands.len());
        let mut paths = Vec::with_capacity(commands.len());
        for c in commands {
            if !seen.insert(c.path.as_str()) {
                return None;
            }
            paths.push(c.path.clone());
        }
        let mut extra: Vec<&str> = commands
            .iter()
            .filter_map(|c| c.clone_source.as_deref())
            .filter(|s| !seen.contains(s))
            .collect();
        extra.sort_unstable();
        extra.dedup();
        let command_count = paths.len();
        paths.extend(extra.into_iter().map(str::to_owned));
        Some(Self {
            paths,
            command_count,
        })
    }

    /// Rebuild a table read back from an archive.
    pub fn from_parts(paths: Vec<String>, command_count: usize) -> Self {
        Self {
            paths,
            command_count,
        }
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn command_count(&self) -> usize {
        self.command_count
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.paths.get(index).map(String::as_str)
    }

    pub fn index_of(&self, path: &str) -> Option<usize> {
        self.paths.iter().position(|p| p == path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_values_match_archive_format() {
        assert_eq!(CommandFlags::DELETE.bits(), 1);
        assert_eq!(CommandFlags::EXTRACT.bits(), 2);
        assert_eq!(CommandFlags::MODIFY_PERMISSIONS.bits(), 4);
        assert_eq!(CommandFlags::BINARY_DIFF.bits(), 8);
        assert_eq!(CommandFlags::CLONE.bits(), 16);
    }

    #[test]
    fn combination_rules() {
        use CommandFlags as F;
        assert!(F::DELETE.is_valid());
        assert!((F::DELETE | F::EXTRACT).is_valid());
        assert!((F::DELETE | F::CLONE).is_valid());
        assert!((F::BINARY_DIFF | F::MODIFY_PERMISSIONS).is_valid());
        assert!((F::CLONE | F::MODIFY_PERMISSIONS).is_valid());

        assert!(!F::empty().is_valid());
        assert!(!(F::DELETE | F::BINARY_DIFF).is_valid());
        assert!(!(F::CLONE | F::EXTRACT).is_valid());
        assert!(!(F::CLONE | F::BINARY_DIFF).is_valid());
        assert!(!F::from_bits_retain(0x20).is_valid());
    }

    #[test]
    fn describe_joins_names() {
        let f = CommandFlags::DELETE | CommandFlags::EXTRACT;
        assert_eq!(f.describe(), "delete+extract");
    }

    #[test]
    fn path_table_appends_clone_sources() {
        let commands = vec![
            Command::new("b.txt", CommandFlags::CLONE).with_clone_source("z.txt"),
            Command::new("c.txt", CommandFlags::CLONE).with_clone_source("a.txt"),
            Command::new("a.txt", CommandFlags::DELETE),
            Command::new("d.txt", CommandFlags::CLONE).with_clone_source("z.txt"),
        ];
        let table = PathTable::for_commands(&commands).unwrap();
        assert_eq!(table.paths(), ["b.txt", "c.txt", "a.txt", "d.txt", "z.txt"]);
        assert_eq!(table.command_count(), 4);
        assert_eq!(table.index_of("z.txt"), Some(4));
        assert_eq!(table.index_of("a.txt"), Some(2));
    }

    #[test]
    fn path_table_rejects_duplicates() {
        let commands = vec![
            Command::new("x", CommandFlags::DELETE),
            Command::new("x", CommandFlags::EXTRACT),
        ];
        assert!(PathTable::for_commands(&commands).is_none());
    }
}
