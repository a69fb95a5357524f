// Control triples and the in-memory diff record.
//
// A control triple tells the patcher to:
//   1. add `copy_len` diff bytes to the old bytes under the cursor,
//   2. append `extra_len` bytes verbatim from the extra stream,
//   3. move the old cursor by `copy_len + seek`.
//
// Integers are serialized the way bsdiff does it: 8 bytes, little-endian
// magnitude, with the sign carried in the top bit of the last byte.

use std::io::{self, Read, Write};

use super::patch::{self, PatchError};

/// Encoded size of one integer.
pub const INT_LEN: usize = 8;

/// Encoded size of one control triple.
pub const TRIPLE_LEN: usize = 3 * INT_LEN;

// ---------------------------------------------------------------------------
// Integer encoding
// ---------------------------------------------------------------------------

/// Encode a signed integer as bsdiff sign-magnitude.
#[inline]
pub fn encode_int(x: i64, buf: &mut [u8; INT_LEN]) {
    let mut y = x.unsigned_abs();
    for b in buf.iter_mut() {
        *b = (y & 0xFF) as u8;
        y >>= 8;
    }
    if x < 0 {
        buf[INT_LEN - 1] |= 0x80;
    }
}

/// Decode a bsdiff sign-magnitude integer.
///
/// The magnitude is limited to 63 bits, so `i64::MIN` cannot be produced.
#[inline]
pub fn decode_int(buf: &[u8; INT_LEN]) -> i64 {
    let mut y: i64 = i64::from(buf[INT_LEN - 1] & 0x7F);
    for i in (0..INT_LEN - 1).rev() {
        y = (y << 8) | i64::from(buf[i]);
    }
    if buf[INT_LEN - 1] & 0x80 != 0 { -y } else { y }
}

// ---------------------------------------------------------------------------
// ControlTriple
// ---------------------------------------------------------------------------

/// One diff step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlTriple {
    /// Bytes taken from the diff stream and added to the old buffer.
    pub copy_len: i64,
    /// Bytes taken verbatim from the extra stream.
    pub extra_len: i64,
    /// Signed adjustment of the old cursor after the copy.
    pub seek: i64,
}

impl ControlTriple {
    pub fn new(copy_len: i64, extra_len: i64, seek: i64) -> Self {
        Self {
            copy_len,
            extra_len,
            seek,
        }
    }

    pub fn encode(&self) -> [u8; TRIPLE_LEN] {
        let mut out = [0u8; TRIPLE_LEN];
        let mut buf = [0u8; INT_LEN];
        for (i, v) in [self.copy_len, self.extra_len, self.seek].into_iter().enumerate() {
            encode_int(v, &mut buf);
            out[i * INT_LEN..(i + 1) * INT_LEN].copy_from_slice(&buf);
        }
        out
    }

    pub fn decode(bytes: &[u8; TRIPLE_LEN]) -> Self {
        let field = |i: usize| {
            let mut buf = [0u8; INT_LEN];
            buf.copy_from_slice(&bytes[i * INT_LEN..(i + 1) * INT_LEN]);
            decode_int(&buf)
        };
        Self {
            copy_len: field(0),
            extra_len: field(1),
            seek: field(2),
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.encode())
    }
}

/// Iterator over encoded control triples read from a stream.
///
/// Yields `PatchError::Corrupt` if the stream ends in the middle of a triple.
/// A clean end of stream terminates the iteration.
pub struct ControlReader<R: Read> {
    reader: R,
    done: bool,
}

impl<R: Read> ControlReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: Read> Iterator for ControlReader<R> {
    type Item = Result<ControlTriple, PatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = [0u8; TRIPLE_LEN];
        let mut filled = 0;
        while filled < TRIPLE_LEN {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(PatchError::Io(e)));
                }
            }
        }
        match filled {
            0 => {
                self.done = true;
                None
            }
            TRIPLE_LEN => Some(Ok(ControlTriple::decode(&buf))),
            _ => {
                self.done = true;
                Some(Err(PatchError::Corrupt("truncated control triple")))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DiffRecord
// ---------------------------------------------------------------------------

/// Output of the diff engine: everything needed to rebuild the new buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffRecord {
    pub controls: Vec<ControlTriple>,
    /// Concatenated `new - old` bytes of every copy region.
    pub diff: Vec<u8>,
    /// Concatenated raw bytes of every gap.
    pub extra: Vec<u8>,
}

impl DiffRecord {
    /// Length of the buffer this record reconstructs.
    pub fn new_len(&self) -> u64 {
        self.controls
            .iter()
            .map(|c| (c.copy_len + c.extra_len) as u64)
            .sum()
    }

    /// Bytes that actually carry information: non-zero diff bytes plus the
    /// extra section. Zero diff bytes compress to almost nothing, so this is
    /// the size that matters when deciding whether a diff is worth it.
    pub fn payload_size(&self) -> u64 {
        let nonzero = self.diff.iter().filter(|&&b| b != 0).count() as u64;
        nonzero + self.extra.len() as u64
    }

    /// Serialized control block.
    pub fn control_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.controls.len() * TRIPLE_LEN);
        for c in &self.controls {
            out.extend_from_slice(&c.encode());
        }
        out
    }

    /// Rebuild the new buffer from `old`.
    pub fn apply(&self, old: &[u8]) -> Result<Vec<u8>, PatchError> {
        let mut diff: &[u8] = &self.diff;
        let mut extra: &[u8] = &self.extra;
        patch::patch(
            old,
            self.controls.iter().copied().map(Ok),
            &mut diff,
            &mut extra,
            self.new_len(),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
