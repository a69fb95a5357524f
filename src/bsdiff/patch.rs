// bspatch: replay control triples against an old buffer.
//
// The control, diff and extra data arrive as three independent streams.
// Every read is checked: a short stream, a negative length, a copy that
// would leave the old buffer, or an output overshoot is a corrupt patch.
// On error nothing is returned, so callers never see partial output.

use std::io::{self, Read};

use super::control::ControlTriple;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// The patch data is inconsistent with the old buffer or with itself.
    #[error("corrupt patch: {0}")]
    Corrupt(&'static str),
    /// A stream failed for a reason other than running out of data.
    #[error("I/O error while patching: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// Rebuild a buffer of `new_len` bytes from `old`.
///
/// Control triples are consumed until the output reaches `new_len`;
/// triples left over after that are ignored.
pub fn patch<I, D, E>(
    old: &[u8],
    controls: I,
    diff: &mut D,
    extra: &mut E,
    new_len: u64,
) -> Result<Vec<u8>, PatchError>
where
    I: IntoIterator<Item = Result<ControlTriple, PatchError>>,
    D: Read + ?Sized,
    E: Read + ?Sized,
{
    let new_len =
        usize::try_from(new_len).map_err(|_| PatchError::Corrupt("declared length too large"))?;
    let mut controls = controls.into_iter();
    let mut out: Vec<u8> = Vec::new();
    let mut old_pos: i64 = 0;

    while out.len() < new_len {
        let ctrl = controls
            .next()
            .ok_or(PatchError::Corrupt("control stream ended early"))??;

        if ctrl.copy_len < 0 || ctrl.extra_len < 0 {
            return Err(PatchError::Corrupt("negative length in control triple"));
        }
        let copy_len = ctrl.copy_len as usize;
        let extra_len = ctrl.extra_len as usize;

        // Copy region: diff bytes plus old bytes.
        if copy_len > new_len - out.len() {
            return Err(PatchError::Corrupt("copy runs past declared length"));
        }
        if copy_len > 0 {
            let from = usize::try_from(old_pos)
                .ok()
                .filter(|&p| p.checked_add(copy_len).is_some_and(|end| end <= old.len()))
                .ok_or(PatchError::Corrupt("copy reads outside the old buffer"))?;
            let start = out.len();
            read_chunk(diff, &mut out, copy_len, "diff stream ended early")?;
            for (o, n) in old[from..from + copy_len].iter().zip(&mut out[start..]) {
                *n = n.wrapping_add(*o);
            }
        }

        // Extra region: raw bytes.
        if extra_len > new_len - out.len() {
            return Err(PatchError::Corrupt("extra runs past declared length"));
        }
        read_chunk(extra, &mut out, extra_len, "extra stream ended early")?;

        old_pos = old_pos
            .checked_add(ctrl.copy_len)
            .and_then(|p| p.checked_add(ctrl.seek))
            .ok_or(PatchError::Corrupt("old cursor overflow"))?;
    }

    if out.len() != new_len {
        return Err(PatchError::Corrupt("output length mismatch"));
    }
    Ok(out)
}

/// Append exactly `len` bytes from `r` to `out`.
///
/// The buffer only grows with bytes actually read, so a declared length
/// never drives an allocation on its own.
fn read_chunk<R: Read + ?Sized>(
    r: &mut R,
    out: &mut Vec<u8>,
    len: usize,
    short: &'static str,
) -> Result<(), PatchError> {
    if len == 0 {
        return Ok(());
    }
    let read = r.take(len as u64).read_to_end(out)?;
    if read != len {
        return Err(PatchError::Corrupt(short));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
