use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{BUF_SIZE, DeltaError, fs_error};
use crate::archive::{ArchiveHeader, ArchiveWriter, CompressionMode};
use crate::command::CommandFlags;
use crate::tree::{
    self, MajorVersion, PlanOptions, TreeHash, TreeSnapshot, hash_snapshot, hash_tree_with_table,
};

// ---------------------------------------------------------------------------
// Options / stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    pub compression: CompressionMode,
    /// Level for `compression`; must not exceed its maximum.
    pub level: u8,
    /// Archive format and tree hash version.
    pub major_version: MajorVersion,
    /// See [`PlanOptions::diff_threshold`].
    pub diff_threshold: f64,
    /// Record the creation time in the header.
    pub timestamp: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        let compression = CompressionMode::default();
        Self {
            compression,
            level: compression.default_level(),
            major_version: MajorVersion::LATEST,
            diff_threshold: PlanOptions::default().diff_threshold,
            timestamp: true,
        }
    }
}

/// Statistics returned by `create_delta()`.
#[derive(Debug, Clone)]
pub struct CreateStats {
    pub before_hash: TreeHash,
    pub after_hash: TreeHash,
    /// Total bytes of regular files in the before tree.
    pub before_size: u64,
    /// Total bytes of regular files in the after tree.
    pub after_size: u64,
    /// Size of the written archive.
    pub archive_size: u64,
    pub commands: usize,
    pub deleted: usize,
    pub extracted: usize,
    pub cloned: usize,
    pub diffed: usize,
    pub chmod: usize,
}

// ---------------------------------------------------------------------------
// create_delta
// ---------------------------------------------------------------------------

/// Write an archive at `archive` that turns the tree at `before` into the
/// tree at `after`.
///
/// A partially written archive is removed on failure. A file already at
/// `archive` is only touched once both trees have been scanned and planned.
pub fn create_delta(
    before: &Path,
    after: &Path,
    archive: &Path,
    options: &CreateOptions,
) -> Result<CreateStats, DeltaError> {
    let mut created = false;
    let result = write_archive(before, after, archive, options, &mut created);
    if result.is_err() && created {
        if let Err(e) = fs::remove_file(archive) {
            log::warn!("cannot remove partial archive {}: {e}", archive.display());
        }
    }
    result
}

fn write_archive(
    before: &Path,
    after: &Path,
    archive: &Path,
    options: &CreateOptions,
    created: &mut bool,
) -> Result<CreateStats, DeltaError> {
    let version = options.major_version;
    let (before_tree, before_hash, before_table) = hash_tree_with_table(before, version)?;
    let after_tree = TreeSnapshot::scan(after)?;
    let after_hash = hash_snapshot(&after_tree, version);
    log::debug!(
        "before {before_hash} ({} distinct files), after {after_hash}",
        before_table.len()
    );

    let plan_options = PlanOptions {
        major_version: version,
        diff_threshold: options.diff_threshold,
    };
    let plan = tree::plan(&before_tree, &before_table, &after_tree, &plan_options)?;

    let mut header = ArchiveHeader::new(version, before_hash, after_hash);
    header.compression = options.compression;
    header.level = options.level;
    if options.timestamp {
        header.created = Some(unix_now());
    }

    let file = File::create(archive).map_err(fs_error(archive))?;
    *created = true;
    let mut writer = ArchiveWriter::new(
        BufWriter::with_capacity(BUF_SIZE, file),
        &header,
        &plan.path_table,
    )?;
    for cmd in &plan.commands {
        writer.write_command(cmd)?;
    }
    let mut out = writer.finish()?;
    out.flush().map_err(fs_error(archive))?;
    let archive_size = out
        .get_ref()
        .metadata()
        .map_err(fs_error(archive))?
        .len();

    let stats = CreateStats {
        before_hash,
        after_hash,
        before_size: before_tree.total_file_size(),
        after_size: after_tree.total_file_size(),
        archive_size,
        commands: plan.commands.len(),
        deleted: plan.count(CommandFlags::DELETE),
        extracted: plan.count(CommandFlags::EXTRACT),
        cloned: plan.count(CommandFlags::CLONE),
        diffed: plan.count(CommandFlags::BINARY_DIFF),
        chmod: plan.count(CommandFlags::MODIFY_PERMISSIONS),
    };
    log::debug!(
        "{} commands, archive {} bytes ({} {})",
        stats.commands,
        stats.archive_size,
        header.compression,
        header.level
    );
    Ok(stats)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
