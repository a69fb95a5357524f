// Whole-tree delta pipeline.
//
// `create_delta` scans a before and an after tree, plans the commands
// between them and writes the archive. `apply_delta` rebuilds the after tree
// in a fresh destination from the before tree and an archive.

mod apply;
mod create;

use std::io;
use std::path::{Path, PathBuf};

pub use apply::{ApplyOptions, ApplyStats, apply_delta};
pub use create::{CreateOptions, CreateStats, create_delta};

use crate::archive::ArchiveError;
use crate::bsdiff::PatchError;
use crate::tree::{PlanError, TreeError, TreeHash};

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

/// Error type for the create/apply pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A filesystem operation failed on a specific path.
    #[error("{}: {source}", path.display())]
    Fs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("cannot patch {path}: {source}")]
    Patch {
        path: String,
        #[source]
        source: PatchError,
    },
    #[error("before tree does not match the archive (expected {expected}, found {actual})")]
    BeforeTreeMismatch { expected: TreeHash, actual: TreeHash },
    #[error("rebuilt tree does not match the archive (expected {expected}, found {actual})")]
    AfterTreeMismatch { expected: TreeHash, actual: TreeHash },
    #[error("destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),
    /// A command would write through a symlink in its parent directories.
    #[error("refusing to follow symlink {link} for {path}")]
    SymlinkInPath { path: String, link: String },
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Attach `path` to an I/O error.
fn fs_error(path: &Path) -> impl FnOnce(io::Error) -> DeltaError + '_ {
    move |source| DeltaError::Fs {
        path: path.to_path_buf(),
        source,
    }
}
