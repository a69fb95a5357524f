use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use super::{BUF_SIZE, DeltaError, fs_error};
use crate::archive::{ArchiveItem, ArchiveReader};
use crate::command::CommandFlags;
use crate::fsops;
use crate::tree::{EntryKind, MajorVersion, TreeHash, hash_tree};

// ---------------------------------------------------------------------------
// Options / stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// Check the before tree against the archive header first.
    pub verify_before: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            verify_before: true,
        }
    }
}

/// Statistics returned by `apply_delta()`.
#[derive(Debug, Clone, Default)]
pub struct ApplyStats {
    pub major: u16,
    pub minor: u16,
    pub after_hash: TreeHash,
    pub commands: usize,
    pub deleted: usize,
    pub extracted: usize,
    pub cloned: usize,
    pub patched: usize,
    pub chmod: usize,
    /// File bytes written by Extract and BinaryDiff commands.
    pub bytes_written: u64,
}

// ---------------------------------------------------------------------------
// apply_delta
// ---------------------------------------------------------------------------

/// Rebuild the after tree of `archive` at `dest` from the tree at `before`.
///
/// `dest` must not exist. `progress` receives the fraction of commands
/// processed so far, ending at 1.0. On error `dest` is left half-built and
/// should be discarded.
pub fn apply_delta(
    before: &Path,
    archive: &Path,
    dest: &Path,
    options: &ApplyOptions,
    progress: &mut dyn FnMut(f64),
) -> Result<ApplyStats, DeltaError> {
    let reader = ArchiveReader::open(archive)?;
    let header = reader.header().clone();

    if options.verify_before {
        let actual = hash_tree(before, header.major)?;
        if actual != header.before_hash {
            return Err(DeltaError::BeforeTreeMismatch {
                expected: header.before_hash,
                actual,
            });
        }
    }
    if fsops::exists_no_follow(dest) {
        return Err(DeltaError::DestinationExists(dest.to_path_buf()));
    }
    let before_dirs = fsops::copy_tree(before, dest).map_err(fs_error(dest))?;

    let total = reader.command_count();
    let mut stats = ApplyStats {
        major: header.major.as_u16(),
        minor: header.minor,
        after_hash: header.after_hash,
        commands: total,
        ..ApplyStats::default()
    };
    let mut ctx = Applier {
        before,
        dest,
        major: header.major,
        dir_modes: before_dirs.into_iter().collect(),
    };

    progress(0.0);
    let mut processed = 0usize;
    reader.for_each_command(|item| -> Result<_, DeltaError> {
        ctx.apply(item, &mut stats)?;
        processed += 1;
        progress(processed as f64 / total as f64);
        Ok(ControlFlow::Continue(()))
    })?;
    ctx.finish()?;
    if total == 0 {
        progress(1.0);
    }

    let actual = hash_tree(dest, header.major)?;
    if actual != header.after_hash {
        return Err(DeltaError::AfterTreeMismatch {
            expected: header.after_hash,
            actual,
        });
    }
    Ok(stats)
}

struct Applier<'p> {
    before: &'p Path,
    dest: &'p Path,
    major: MajorVersion,
    /// Directory modes, applied once every command has run so read-only
    /// directories can still be filled. Later commands overwrite entries
    /// seeded from the before tree.
    dir_modes: BTreeMap<PathBuf, u16>,
}

impl Applier<'_> {
    fn apply<S: Read>(&mut self, item: &mut ArchiveItem<'_, S>, stats: &mut ApplyStats) -> Result<(), DeltaError> {
        let flags = item.flags();
        self.check_parents(item.path())?;
        let target = self.dest.join(item.path());

        if flags.contains(CommandFlags::DELETE) {
            fsops::remove_path(&target).map_err(fs_error(&target))?;
            log::info!("Deleted {}", item.path());
            stats.deleted += 1;
        }

        if flags.contains(CommandFlags::EXTRACT) {
            self.extract(item, &target, stats)?;
            log::info!("Extracted {}", item.path());
            stats.extracted += 1;
        } else if flags.contains(CommandFlags::CLONE) {
            self.clone_from_before(item, &target)?;
            stats.cloned += 1;
        } else if flags.contains(CommandFlags::BINARY_DIFF) {
            self.patch(item, &target, stats)?;
            if flags.contains(CommandFlags::MODIFY_PERMISSIONS) {
                fsops::set_mode(&target, item.permissions()).map_err(fs_error(&target))?;
                stats.chmod += 1;
            }
            log::info!("Patched {}", item.path());
            stats.patched += 1;
        } else if flags.contains(CommandFlags::MODIFY_PERMISSIONS) {
            self.set_mode(&target, item.permissions())?;
            log::info!("Modified {} ({:o})", item.path(), item.permissions());
            stats.chmod += 1;
        }
        Ok(())
    }

    fn extract<S: Read>(
        &mut self,
        item: &mut ArchiveItem<'_, S>,
        target: &Path,
        stats: &mut ApplyStats,
    ) -> Result<(), DeltaError> {
        let kind = item
            .kind()
            .ok_or_else(|| DeltaError::Unsupported(format!("unknown entry type for {}", item.path())))?;
        match kind {
            EntryKind::Directory => {
                if !target.is_dir() || fsops::is_symlink(target) {
                    fsops::remove_path(target).map_err(fs_error(target))?;
                    fs::create_dir(target).map_err(fs_error(target))?;
                }
                self.dir_modes.insert(target.to_path_buf(), item.permissions());
            }
            EntryKind::File => {
                fsops::remove_path(target).map_err(fs_error(target))?;
                let file = File::create(target).map_err(fs_error(target))?;
                let mut w = BufWriter::with_capacity(BUF_SIZE, file);
                stats.bytes_written += item.copy_to(&mut w)?;
                w.flush().map_err(fs_error(target))?;
                drop(w);
                fsops::set_mode(target, item.permissions()).map_err(fs_error(target))?;
            }
            EntryKind::Symlink => {
                let link = item
                    .link_target()
                    .ok_or_else(|| DeltaError::Unsupported(format!("link without target: {}", item.path())))?;
                fsops::remove_path(target).map_err(fs_error(target))?;
                fsops::create_symlink(Path::new(link), target).map_err(fs_error(target))?;
            }
        }
        Ok(())
    }

    fn clone_from_before<S: Read>(&mut self, item: &ArchiveItem<'_, S>, target: &Path) -> Result<(), DeltaError> {
        if !self.major.supports_clone() {
            return Err(DeltaError::Unsupported(format!(
                "clone of {} in a version {} archive",
                item.path(),
                self.major
            )));
        }
        let source_path = item
            .clone_source()
            .ok_or_else(|| DeltaError::Unsupported(format!("clone without source: {}", item.path())))?;
        let source = self.before.join(source_path);
        fsops::remove_path(target).map_err(fs_error(target))?;
        fs::copy(&source, target).map_err(fs_error(&source))?;
        fsops::set_mode(target, item.permissions()).map_err(fs_error(target))?;
        log::info!("Cloned {} from {}", item.path(), source_path);
        Ok(())
    }

    fn patch<S: Read>(
        &mut self,
        item: &mut ArchiveItem<'_, S>,
        target: &Path,
        stats: &mut ApplyStats,
    ) -> Result<(), DeltaError> {
        let old_path = self.before.join(item.path());
        let old = fs::read(&old_path).map_err(fs_error(&old_path))?;
        let record = item.read_diff()?;
        let new = record.apply(&old).map_err(|source| DeltaError::Patch {
            path: item.path().to_string(),
            source,
        })?;

        // Rewrite through a fresh inode; the old file may be read-only.
        let perms = fs::symlink_metadata(target)
            .map_err(fs_error(target))?
            .permissions();
        fsops::remove_path(target).map_err(fs_error(target))?;
        fs::write(target, &new).map_err(fs_error(target))?;
        fs::set_permissions(target, perms).map_err(fs_error(target))?;
        stats.bytes_written += new.len() as u64;
        Ok(())
    }

    fn set_mode(&mut self, target: &Path, mode: u16) -> Result<(), DeltaError> {
        if target.is_dir() && !fsops::is_symlink(target) {
            self.dir_modes.insert(target.to_path_buf(), mode);
            Ok(())
        } else {
            fsops::set_mode(target, mode).map_err(fs_error(target))
        }
    }

    /// Fail if any parent of `path` under the destination is a symlink.
    fn check_parents(&self, path: &str) -> Result<(), DeltaError> {
        let mut current = self.dest.to_path_buf();
        let mut rel = String::new();
        let mut components = path.split('/').peekable();
        while let Some(component) = components.next() {
            if components.peek().is_none() {
                break;
            }
            current.push(component);
            if !rel.is_empty() {
                rel.push('/');
            }
            rel.push_str(component);
            if fsops::is_symlink(&current) {
                return Err(DeltaError::SymlinkInPath {
                    path: path.to_string(),
                    link: rel,
                });
            }
        }
        Ok(())
    }

    /// Apply deferred directory modes, deepest first. Directories removed
    /// or replaced since are skipped.
    fn finish(&mut self) -> Result<(), DeltaError> {
        let dir_modes = std::mem::take(&mut self.dir_modes);
        for (path, mode) in dir_modes.into_iter().rev() {
            let is_dir = fs::symlink_metadata(&path).is_ok_and(|m| m.is_dir());
            if is_dir {
                fsops::set_mode(&path, mode).map_err(fs_error(&path))?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
