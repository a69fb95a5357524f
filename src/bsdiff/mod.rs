// bsdiff-style byte diffing and patching.
//
// Sub-modules:
// - `suffix`: qsufsort suffix array and longest-match search
// - `diff`: match search producing control triples
// - `patch`: streaming patch application
// - `control`: triple encoding and the in-memory diff record
// - `format`: single-file `BSDIFN40` container

pub mod control;
pub mod diff;
pub mod format;
pub mod patch;
pub mod suffix;

pub use control::{ControlTriple, DiffRecord};
pub use diff::diff;
pub use patch::{PatchError, patch};
