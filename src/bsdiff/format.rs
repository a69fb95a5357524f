// Single-file patch container.
//
// Layout (all integers bsdiff sign-magnitude):
//
//   0       8   "BSDIFN40"
//   8       8   control block length X
//   16      8   diff block length Y
//   24      8   new file length
//   32      X   control block
//   32+X    Y   diff block
//   32+X+Y  ..  extra block
//
// Blocks are stored raw. The bzip2 flavour ("BSDIFF40") is recognized and
// rejected.

use std::io::{self, Write};

use super::control::{ControlReader, DiffRecord, INT_LEN, decode_int, encode_int};
use super::patch::{self, PatchError};

/// Magic of a raw patch.
pub const MAGIC: &[u8; 8] = b"BSDIFN40";

/// Magic of a bzip2-compressed patch.
pub const BZIP2_MAGIC: &[u8; 8] = b"BSDIFF40";

/// Fixed header size.
pub const HEADER_LEN: usize = 32;

/// Write `record` as a raw patch.
pub fn write_patch<W: Write>(w: &mut W, record: &DiffRecord) -> io::Result<()> {
    let controls = record.control_bytes();
    let mut buf = [0u8; INT_LEN];

    w.write_all(MAGIC)?;
    for v in [
        controls.len() as i64,
        record.diff.len() as i64,
        record.new_len() as i64,
    ] {
        encode_int(v, &mut buf);
        w.write_all(&buf)?;
    }
    w.write_all(&controls)?;
    w.write_all(&record.diff)?;
    w.write_all(&record.extra)?;
    Ok(())
}

/// Apply a raw patch to `old`.
pub fn apply_patch(old: &[u8], patch_data: &[u8]) -> Result<Vec<u8>, PatchError> {
    if patch_data.len() < HEADER_LEN {
        return Err(PatchError::Corrupt("patch shorter than its header"));
    }
    let magic = &patch_data[..8];
    if magic == BZIP2_MAGIC {
        return Err(PatchError::Corrupt("bzip2 patches are not supported"));
    }
    if magic != MAGIC {
        return Err(PatchError::Corrupt("bad magic"));
    }

    let field = |i: usize| {
        let mut buf = [0u8; INT_LEN];
        buf.copy_from_slice(&patch_data[8 + i * INT_LEN..8 + (i + 1) * INT_LEN]);
        decode_int(&buf)
    };
    let (ctrl_len, diff_len, new_len) = (field(0), field(1), field(2));
    if ctrl_len < 0 || diff_len < 0 || new_len < 0 {
        return Err(PatchError::Corrupt("negative length in header"));
    }

    let body = &patch_data[HEADER_LEN..];
    let ctrl_len = ctrl_len as u64;
    let diff_len = diff_len as u64;
    if ctrl_len.saturating_add(diff_len) > body.len() as u64 {
        return Err(PatchError::Corrupt("block lengths exceed patch size"));
    }
    let (controls, rest) = body.split_at(ctrl_len as usize);
    let (mut diff, mut extra) = rest.split_at(diff_len as usize);

    patch::patch(
        old,
        ControlReader::new(controls),
        &mut diff,
        &mut extra,
        new_len as u64,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
