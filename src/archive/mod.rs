// Delta archive container.
//
// Sub-modules:
// - `varint`: base-128 big-endian integers
// - `compression`: body compression modes
// - `header`: prefix, format sniffing and the archive header
// - `writer`: forward-only encoder
// - `reader`: forward-only decoder

pub mod compression;
pub mod header;
pub mod reader;
pub mod varint;
pub mod writer;

use std::io;

pub use compression::CompressionMode;
pub use header::{ArchiveFormat, ArchiveHeader};
pub use reader::{ArchiveItem, ArchiveReader, read_header};
pub use writer::ArchiveWriter;

/// Upper bound on path table entries.
pub const MAX_PATH_TABLE_ENTRIES: u64 = 1 << 20;

/// Upper bound on the encoded path table.
pub const MAX_PATH_TABLE_BYTES: u64 = 64 * 1024 * 1024;

/// Longest symlink target stored in an archive.
pub const MAX_LINK_TARGET_LEN: u64 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("not a delta archive (bad magic)")]
    BadMagic,
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(ArchiveFormat),
    #[error("bad compression value {0}")]
    BadCompressionValue(u8),
    #[error("compression level {level} out of range for {mode}")]
    BadCompressionLevel { mode: CompressionMode, level: u8 },
    #[error("{0} compression is not enabled in this build")]
    CompressionUnavailable(CompressionMode),
    #[error("unsupported major version {0}")]
    UnsupportedVersion(u16),
    /// A length, count or section is inconsistent or truncated.
    #[error("bad chunk size at offset {offset}: {what}")]
    BadChunkSize { offset: u64, what: &'static str },
    #[error("clone index {index} out of range at offset {offset}")]
    BadCloneLookup { index: u64, offset: u64 },
    #[error("too many files ({0})")]
    TooManyFiles(u64),
    #[error("link target for {path} is too long ({len} bytes)")]
    LinkTooLong { path: String, len: u64 },
    #[error("invalid command flags {flags:#04x} for {path}")]
    InvalidCommand { path: String, flags: u8 },
    #[error("invalid path in archive: {0:?}")]
    InvalidPath(String),
    /// Writer side: the command list does not follow the path table.
    #[error("command for {path} does not match path table entry {expected:?}")]
    CommandOutOfOrder {
        path: String,
        expected: Option<String>,
    },
    /// Writer side: the command lacks the data its flags require.
    #[error("command for {0} is missing its payload")]
    MissingPayload(String),
    /// Writer side: a clone source is not in the path table.
    #[error("clone source {0} is not in the path table")]
    UnknownCloneSource(String),
    /// Writer side: `finish` was called before every command was written.
    #[error("{written} of {expected} commands written")]
    IncompleteCommands { written: usize, expected: usize },
}

/// Reject absolute paths, parent references and empty components.
pub fn validate_path(path: &str) -> Result<(), ArchiveError> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path
            .split('/')
            .any(|c| c.is_empty() || c == "." || c == "..");
    if bad {
        Err(ArchiveError::InvalidPath(path.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation() {
        for ok in ["a", "a/b.txt", "Contents/MacOS/app", "..hidden", "a/.b"] {
            assert!(validate_path(ok).is_ok(), "{ok}");
        }
        for bad in ["", "/etc/passwd", "../x", "a/../../b", "a//b", "a/./b", "a/", "c:\\x"] {
            assert!(validate_path(bad).is_err(), "{bad}");
        }
    }
}
