// Tree diff planning.
//
// Compares a before and an after snapshot and produces the ordered command
// list that turns one into the other. Commands are emitted in lexical path
// order, so a parent directory is always handled before its children.
//
// Per-path rules:
// - removed path: Delete (nothing for descendants of a removed directory)
// - added directory or symlink: Extract
// - added file: Clone from an identical before file, else Extract
// - kind change: Delete plus the rule for an added entry
// - symlink target change: Delete|Extract
// - same contents, new permissions: ModifyPermissions
// - new contents found elsewhere in the before tree: Clone
// - otherwise: BinaryDiff (|ModifyPermissions), or Extract when the diff
//   carries more than `diff_threshold` of the new file

use std::io;
use std::path::PathBuf;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::entry::{EntryKind, FileEntry, TreeError, TreeSnapshot};
use super::hash::{FileHashTable, MajorVersion};
use crate::bsdiff::{self, DiffRecord};
use crate::command::{Command, CommandFlags, Payload, PathTable};

// ---------------------------------------------------------------------------
// Options / output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PlanOptions {
    pub major_version: MajorVersion,
    /// A diff whose payload exceeds this fraction of the new file size is
    /// replaced by a full Extract.
    pub diff_threshold: f64,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            major_version: MajorVersion::LATEST,
            diff_threshold: 0.8,
        }
    }
}

/// Ordered command list and its path table.
#[derive(Debug, Clone)]
pub struct Plan {
    pub commands: Vec<Command>,
    pub path_table: PathTable,
}

impl Plan {
    /// Number of commands carrying all of `flags`.
    pub fn count(&self, flags: CommandFlags) -> usize {
        self.commands.iter().filter(|c| c.flags.contains(flags)).count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    /// A file could not be read while computing its diff.
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    /// A Clone refers to a path the archive would not record.
    #[error("clone source {clone_source} for {path} is not in the path table")]
    AmbiguousClone { path: String, clone_source: String },
    #[error("duplicate command path {0}")]
    DuplicatePath(String),
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// A changed file waiting for its binary diff.
struct DiffJob {
    slot: usize,
    path: String,
    old: PathBuf,
    new: PathBuf,
    new_mode: u16,
    mode_changed: bool,
}

enum Slot {
    Ready(Command),
    Pending,
}

/// Plan the commands turning `before` into `after`.
///
/// `table` indexes the files of `before` by content and picks clone
/// sources.
pub fn plan(
    before: &TreeSnapshot,
    table: &FileHashTable,
    after: &TreeSnapshot,
    options: &PlanOptions,
) -> Result<Plan, PlanError> {
    let allow_clone = options.major_version.supports_clone();

    let mut slots: Vec<Slot> = Vec::new();
    let mut jobs: Vec<DiffJob> = Vec::new();
    let mut removed_pos = before.iter().peekable();

    // Walk both sorted sequences together so commands come out in path order.
    for entry in after.iter() {
        while let Some(b) = removed_pos.next_if(|b| b.path < entry.path) {
            if !after.contains(&b.path) && !has_replaced_ancestor(before, after, &b.path) {
                log::info!("Removed {}", b.path);
                slots.push(Slot::Ready(Command::new(&b.path, CommandFlags::DELETE)));
            }
        }
        removed_pos.next_if(|b| b.path == entry.path);

        match before.get(&entry.path) {
            Some(old) if old.kind == entry.kind => {
                plan_changed(old, entry, before, after, table, allow_clone, &mut slots, &mut jobs);
            }
            Some(old) => {
                log::info!("Replaced {} ({} -> {})", entry.path, old.kind, entry.kind);
                let cmd = plan_added(entry, after, table, allow_clone);
                slots.push(Slot::Ready(Command {
                    flags: cmd.flags | CommandFlags::DELETE,
                    ..cmd
                }));
            }
            None => {
                log::info!("Added {}", entry.path);
                slots.push(Slot::Ready(plan_added(entry, after, table, allow_clone)));
            }
        }
    }
    for b in removed_pos {
        if !after.contains(&b.path) && !has_replaced_ancestor(before, after, &b.path) {
            log::info!("Removed {}", b.path);
            slots.push(Slot::Ready(Command::new(&b.path, CommandFlags::DELETE)));
        }
    }

    for (job, record) in run_diffs(&jobs)? {
        slots[job.slot] = Slot::Ready(finish_diff(job, record, after, options.diff_threshold));
    }

    let commands: Vec<Command> = slots
        .into_iter()
        .filter_map(|s| match s {
            Slot::Ready(c) => Some(c),
            Slot::Pending => None,
        })
        .collect();

    let path_table = PathTable::for_commands(&commands).ok_or_else(|| {
        let mut seen = std::collections::HashSet::new();
        let dup = commands
            .iter()
            .find(|c| !seen.insert(c.path.as_str()))
            .map(|c| c.path.clone())
            .unwrap_or_default();
        PlanError::DuplicatePath(dup)
    })?;

    for c in &commands {
        if let Some(src) = &c.clone_source {
            if path_table.index_of(src).is_none() || !before.get(src).is_some_and(FileEntry::is_file) {
                return Err(PlanError::AmbiguousClone {
                    path: c.path.clone(),
                    clone_source: src.clone(),
                });
            }
        }
    }

    log::debug!(
        "planned {} commands ({} table entries)",
        commands.len(),
        path_table.len()
    );
    Ok(Plan {
        commands,
        path_table,
    })
}

/// Is some ancestor of `path` deleted or turned into a non-directory?
/// Its own Delete then removes `path` too.
fn has_replaced_ancestor(before: &TreeSnapshot, after: &TreeSnapshot, path: &str) -> bool {
    let mut cur = path;
    while let Some(idx) = cur.rfind('/') {
        cur = &cur[..idx];
        if before.contains(cur) && !after.get(cur).is_some_and(FileEntry::is_dir) {
            return true;
        }
    }
    false
}

fn plan_added(
    entry: &FileEntry,
    after: &TreeSnapshot,
    table: &FileHashTable,
    allow_clone: bool,
) -> Command {
    match entry.kind {
        EntryKind::File => {
            if allow_clone {
                if let Some(src) = table.first(&entry.content_hash) {
                    return Command::new(&entry.path, CommandFlags::CLONE)
                        .with_mode(entry.mode)
                        .with_clone_source(src);
                }
            }
            extract_file(entry, after)
        }
        EntryKind::Directory => Command::new(&entry.path, CommandFlags::EXTRACT)
            .with_mode(entry.kind.type_bits() | entry.mode),
        EntryKind::Symlink => Command::new(&entry.path, CommandFlags::EXTRACT)
            .with_mode(entry.kind.type_bits() | entry.mode)
            .with_payload(Payload::Link(entry.link_target.clone().unwrap_or_default())),
    }
}

fn extract_file(entry: &FileEntry, after: &TreeSnapshot) -> Command {
    Command::new(&entry.path, CommandFlags::EXTRACT)
        .with_mode(entry.kind.type_bits() | entry.mode)
        .with_payload(Payload::File(after.full_path(&entry.path)))
}

#[allow(clippy::too_many_arguments)]
fn plan_changed(
    old: &FileEntry,
    new: &FileEntry,
    before: &TreeSnapshot,
    after: &TreeSnapshot,
    table: &FileHashTable,
    allow_clone: bool,
    slots: &mut Vec<Slot>,
    jobs: &mut Vec<DiffJob>,
) {
    let mode_changed = old.mode != new.mode;
    match new.kind {
        EntryKind::Directory => {
            if mode_changed {
                log::info!("Modified {} (permissions)", new.path);
                slots.push(Slot::Ready(
                    Command::new(&new.path, CommandFlags::MODIFY_PERMISSIONS).with_mode(new.mode),
                ));
            }
        }
        EntryKind::Symlink => {
            if old.link_target != new.link_target {
                log::info!("Relinked {}", new.path);
                let cmd = plan_added(new, after, table, allow_clone);
                slots.push(Slot::Ready(Command {
                    flags: cmd.flags | CommandFlags::DELETE,
                    ..cmd
                }));
            }
        }
        EntryKind::File => {
            if old.content_hash == new.content_hash {
                if mode_changed {
                    log::info!("Modified {} (permissions)", new.path);
                    slots.push(Slot::Ready(
                        Command::new(&new.path, CommandFlags::MODIFY_PERMISSIONS)
                            .with_mode(new.mode),
                    ));
                }
                return;
            }
            if allow_clone {
                if let Some(src) = table.first(&new.content_hash) {
                    log::info!("Cloned {} from {}", new.path, src);
                    slots.push(Slot::Ready(
                        Command::new(&new.path, CommandFlags::CLONE)
                            .with_mode(new.mode)
                            .with_clone_source(src),
                    ));
                    return;
                }
            }
            jobs.push(DiffJob {
                slot: slots.len(),
                path: new.path.clone(),
                old: before.full_path(&old.path),
                new: after.full_path(&new.path),
                new_mode: new.mode,
                mode_changed,
            });
            slots.push(Slot::Pending);
        }
    }
}

fn diff_one(job: &DiffJob) -> Result<DiffRecord, PlanError> {
    let read = |p: &PathBuf| {
        std::fs::read(p).map_err(|source| PlanError::Read {
            path: job.path.clone(),
            source,
        })
    };
    let old = read(&job.old)?;
    let new = read(&job.new)?;
    Ok(bsdiff::diff(&old, &new))
}

#[cfg(not(feature = "parallel"))]
fn run_diffs(jobs: &[DiffJob]) -> Result<Vec<(&DiffJob, DiffRecord)>, PlanError> {
    jobs.iter().map(|j| Ok((j, diff_one(j)?))).collect()
}

#[cfg(feature = "parallel")]
fn run_diffs(jobs: &[DiffJob]) -> Result<Vec<(&DiffJob, DiffRecord)>, PlanError> {
    jobs.par_iter().map(|j| Ok((j, diff_one(j)?))).collect()
}

fn finish_diff(job: &DiffJob, record: DiffRecord, after: &TreeSnapshot, threshold: f64) -> Command {
    let new_size = record.new_len();
    let payload = record.payload_size();
    if payload as f64 > threshold * new_size as f64 {
        log::warn!(
            "diff for {} carries {} of {} bytes, storing whole file",
            job.path,
            payload,
            new_size
        );
        return Command::new(&job.path, CommandFlags::EXTRACT)
            .with_mode(EntryKind::File.type_bits() | job.new_mode)
            .with_payload(Payload::File(after.full_path(&job.path)));
    }

    log::info!("Diffed {} ({} payload bytes)", job.path, payload);
    let mut flags = CommandFlags::BINARY_DIFF;
    if job.mode_changed {
        flags |= CommandFlags::MODIFY_PERMISSIONS;
    }
    Command::new(&job.path, flags)
        .with_mode(job.new_mode)
        .with_payload(Payload::Diff(record))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn write(root: &Path, path: &str, data: &[u8]) {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, data).unwrap();
    }

    fn plan_dirs(before: &Path, after: &Path, options: PlanOptions) -> Plan {
        let b = TreeSnapshot::scan(before).unwrap();
        let a = TreeSnapshot::scan(after).unwrap();
        plan(&b, &FileHashTable::from_snapshot(&b), &a, &options).unwrap()
    }

    fn summary(plan: &Plan) -> Vec<(String, CommandFlags)> {
        plan.commands
            .iter()
            .map(|c| (c.path.clone(), c.flags))
            .collect()
    }

    fn big_text(seed: u8) -> Vec<u8> {
        (0..4096u32)
            .map(|i| b'a' + ((i * 31 + seed as u32) % 26) as u8)
            .collect()
    }

    #[test]
    fn identical_trees_need_no_commands() {
        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        for root in [before.path(), after.path()] {
            write(root, "a/b.txt", b"same");
            write(root, "c.txt", b"also same");
        }
        let plan = plan_dirs(before.path(), after.path(), PlanOptions::default());
        assert!(plan.commands.is_empty());
        assert!(plan.path_table.is_empty());
    }

    #[test]
    fn removed_directory_hides_descendants() {
        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        write(before.path(), "gone/x.txt", b"x");
        write(before.path(), "gone/deeper/y.txt", b"y");
        write(before.path(), "keep.txt", b"k");
        write(after.path(), "keep.txt", b"k");

        let plan = plan_dirs(before.path(), after.path(), PlanOptions::default());
        assert_eq!(summary(&plan), [("gone".to_string(), CommandFlags::DELETE)]);
    }

    #[test]
    fn added_files_and_directories_are_extracted() {
        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        write(after.path(), "new/file.txt", b"fresh content");

        let plan = plan_dirs(before.path(), after.path(), PlanOptions::default());
        assert_eq!(
            summary(&plan),
            [
                ("new".to_string(), CommandFlags::EXTRACT),
                ("new/file.txt".to_string(), CommandFlags::EXTRACT),
            ]
        );
        assert_eq!(EntryKind::from_mode(plan.commands[0].mode), Some(EntryKind::Directory));
        assert_eq!(EntryKind::from_mode(plan.commands[1].mode), Some(EntryKind::File));
        assert!(matches!(plan.commands[1].payload, Payload::File(_)));
    }

    #[test]
    fn moved_file_is_cloned_and_source_deleted() {
        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        write(before.path(), "old_name.txt", b"moving contents");
        write(after.path(), "new_name.txt", b"moving contents");

        let plan = plan_dirs(before.path(), after.path(), PlanOptions::default());
        assert_eq!(
            summary(&plan),
            [
                ("new_name.txt".to_string(), CommandFlags::CLONE),
                ("old_name.txt".to_string(), CommandFlags::DELETE),
            ]
        );
        assert_eq!(plan.commands[0].clone_source.as_deref(), Some("old_name.txt"));
    }

    #[test]
    fn clone_keeps_source_when_it_survives() {
        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        write(before.path(), "a.txt", b"shared");
        write(after.path(), "a.txt", b"shared");
        write(after.path(), "b.txt", b"shared");

        let plan = plan_dirs(before.path(), after.path(), PlanOptions::default());
        assert_eq!(summary(&plan), [("b.txt".to_string(), CommandFlags::CLONE)]);
    }

    #[test]
    fn clone_prefers_lexically_first_source() {
        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        write(before.path(), "z.txt", b"dup");
        write(before.path(), "m.txt", b"dup");
        write(after.path(), "z.txt", b"dup");
        write(after.path(), "m.txt", b"dup");
        write(after.path(), "n.txt", b"dup");

        let plan = plan_dirs(before.path(), after.path(), PlanOptions::default());
        assert_eq!(plan.commands[0].clone_source.as_deref(), Some("m.txt"));
        assert_eq!(plan.path_table.paths(), ["n.txt", "m.txt"]);
    }

    #[test]
    fn v2_never_clones() {
        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        write(before.path(), "a.txt", b"shared");
        write(after.path(), "b.txt", b"shared");

        let options = PlanOptions {
            major_version: MajorVersion::V2,
            ..Default::default()
        };
        let plan = plan_dirs(before.path(), after.path(), options);
        assert_eq!(
            summary(&plan),
            [
                ("a.txt".to_string(), CommandFlags::DELETE),
                ("b.txt".to_string(), CommandFlags::EXTRACT),
            ]
        );
    }

    #[test]
    fn small_edit_becomes_binary_diff() {
        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        let old = big_text(0);
        let mut new = old.clone();
        new[100] = b'#';
        write(before.path(), "doc.txt", &old);
        write(after.path(), "doc.txt", &new);

        let plan = plan_dirs(before.path(), after.path(), PlanOptions::default());
        assert_eq!(summary(&plan), [("doc.txt".to_string(), CommandFlags::BINARY_DIFF)]);
        let Payload::Diff(record) = &plan.commands[0].payload else {
            panic!("expected diff payload");
        };
        assert_eq!(record.apply(&old).unwrap(), new);
    }

    #[test]
    fn unrelated_rewrite_falls_back_to_extract() {
        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        let old: Vec<u8> = (0..4096u32).map(|i| (i * 7919 % 256) as u8).collect();
        let new: Vec<u8> = (0..4096u32).map(|i| (i * 104_729 % 253) as u8 ^ 0x5A).collect();
        write(before.path(), "blob.bin", &old);
        write(after.path(), "blob.bin", &new);

        let options = PlanOptions {
            diff_threshold: 0.0,
            ..Default::default()
        };
        let plan = plan_dirs(before.path(), after.path(), options);
        assert_eq!(summary(&plan), [("blob.bin".to_string(), CommandFlags::EXTRACT)]);
    }

    #[test]
    fn kind_change_deletes_then_extracts() {
        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        write(before.path(), "thing", b"was a file");
        write(after.path(), "thing/inner.txt", b"now a directory");

        let plan = plan_dirs(before.path(), after.path(), PlanOptions::default());
        assert_eq!(
            summary(&plan),
            [
                ("thing".to_string(), CommandFlags::DELETE | CommandFlags::EXTRACT),
                ("thing/inner.txt".to_string(), CommandFlags::EXTRACT),
            ]
        );
    }

    #[test]
    fn directory_replaced_by_file_hides_old_children() {
        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        write(before.path(), "thing/inner.txt", b"old child");
        write(after.path(), "thing", b"now a file");

        let plan = plan_dirs(before.path(), after.path(), PlanOptions::default());
        assert_eq!(
            summary(&plan),
            [("thing".to_string(), CommandFlags::DELETE | CommandFlags::EXTRACT)]
        );
    }

    #[cfg(unix)]
    #[test]
    fn permission_only_change() {
        use std::os::unix::fs::PermissionsExt;

        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        write(before.path(), "run.sh", b"echo hi");
        write(after.path(), "run.sh", b"echo hi");
        fs::set_permissions(before.path().join("run.sh"), fs::Permissions::from_mode(0o644))
            .unwrap();
        fs::set_permissions(after.path().join("run.sh"), fs::Permissions::from_mode(0o755))
            .unwrap();

        let plan = plan_dirs(before.path(), after.path(), PlanOptions::default());
        assert_eq!(
            summary(&plan),
            [("run.sh".to_string(), CommandFlags::MODIFY_PERMISSIONS)]
        );
        assert_eq!(plan.commands[0].mode, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_retarget_is_delete_extract() {
        let before = tempfile::tempdir().unwrap();
        let after = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("one", before.path().join("link")).unwrap();
        std::os::unix::fs::symlink("two", after.path().join("link")).unwrap();

        let plan = plan_dirs(before.path(), after.path(), PlanOptions::default());
        assert_eq!(
            summary(&plan),
            [("link".to_string(), CommandFlags::DELETE | CommandFlags::EXTRACT)]
        );
        assert_eq!(plan.commands[0].payload, Payload::Link("two".to_string()));
    }
}
