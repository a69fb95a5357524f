// Directory trees: snapshots, fingerprints and diff planning.

pub mod entry;
pub mod hash;
pub mod plan;

pub use entry::{EntryKind, FileEntry, TreeError, TreeSnapshot};
pub use hash::{FileHashTable, MajorVersion, TreeHash, hash_snapshot, hash_tree, hash_tree_with_table};
pub use plan::{Plan, PlanError, PlanOptions, plan};
