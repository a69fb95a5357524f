// Archive prefix and header.
//
// Uncompressed prefix (6 bytes):
//   magic "TDLT" | compression mode u8 | compression level u8
//
// First fields of the compressed body:
//   major u16le | minor u16le | before hash [32] | after hash [32]
//   created flag u8 (+ u64le seconds since the Unix epoch when set)

use std::fmt;
use std::io::{Read, Write};

use super::ArchiveError;
use super::compression::CompressionMode;
use super::reader::CountingReader;
use crate::tree::{MajorVersion, TreeHash};

pub const MAGIC: &[u8; 4] = b"TDLT";

/// Magic of the legacy xar-based container.
pub const LEGACY_MAGIC: &[u8; 4] = b"xar!";

pub const PREFIX_LEN: usize = 6;

/// Container family, decided from the first four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Modern,
    Legacy,
}

impl ArchiveFormat {
    pub fn sniff(magic: &[u8]) -> Option<Self> {
        if magic.starts_with(MAGIC) {
            Some(ArchiveFormat::Modern)
        } else if magic.starts_with(LEGACY_MAGIC) {
            Some(ArchiveFormat::Legacy)
        } else {
            None
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveFormat::Modern => "modern",
            ArchiveFormat::Legacy => "legacy xar",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub compression: CompressionMode,
    pub level: u8,
    pub major: MajorVersion,
    pub minor: u16,
    pub before_hash: TreeHash,
    pub after_hash: TreeHash,
    /// Creation time, seconds since the Unix epoch.
    pub created: Option<u64>,
}

impl ArchiveHeader {
    pub fn new(major: MajorVersion, before_hash: TreeHash, after_hash: TreeHash) -> Self {
        Self {
            compression: CompressionMode::default(),
            level: CompressionMode::default().default_level(),
            major,
            minor: major.latest_minor(),
            before_hash,
            after_hash,
            created: None,
        }
    }

    pub fn write_prefix<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        w.write_all(MAGIC)?;
        w.write_all(&[self.compression.as_u8(), self.level])?;
        Ok(())
    }

    pub fn write_body<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        w.write_all(&self.major.as_u16().to_le_bytes())?;
        w.write_all(&self.minor.to_le_bytes())?;
        w.write_all(self.before_hash.as_bytes())?;
        w.write_all(self.after_hash.as_bytes())?;
        match self.created {
            Some(secs) => {
                w.write_all(&[1])?;
                w.write_all(&secs.to_le_bytes())?;
            }
            None => w.write_all(&[0])?,
        }
        Ok(())
    }

    /// Parse the uncompressed prefix. Returns `(mode, level)`.
    pub fn read_prefix<R: Read + ?Sized>(r: &mut R) -> Result<(CompressionMode, u8), ArchiveError> {
        let mut prefix = [0u8; PREFIX_LEN];
        let mut filled = 0;
        while filled < PREFIX_LEN {
            match r.read(&mut prefix[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        match ArchiveFormat::sniff(&prefix[..filled]) {
            Some(ArchiveFormat::Modern) if filled == PREFIX_LEN => {}
            Some(ArchiveFormat::Legacy) => {
                return Err(ArchiveError::UnsupportedFormat(ArchiveFormat::Legacy));
            }
            _ => return Err(ArchiveError::BadMagic),
        }
        let mode = CompressionMode::from_u8(prefix[4])?;
        Ok((mode, prefix[5]))
    }

    /// Parse the header fields at the start of the decompressed body.
    pub(crate) fn read_body<R: Read>(
        r: &mut CountingReader<R>,
        compression: CompressionMode,
        level: u8,
    ) -> Result<Self, ArchiveError> {
        let major = r.read_u16("major version")?;
        let major = MajorVersion::from_u16(major).ok_or(ArchiveError::UnsupportedVersion(major))?;
        let minor = r.read_u16("minor version")?;
        let before_hash = TreeHash(r.read_array("before tree hash")?);
        let after_hash = TreeHash(r.read_array("after tree hash")?);
        let created = match r.read_u8("creation flag")? {
            0 => None,
            1 => Some(u64::from_le_bytes(r.read_array("creation time")?)),
            _ => {
                return Err(ArchiveError::BadChunkSize {
                    offset: r.offset(),
                    what: "creation flag",
                });
            }
        };
        Ok(Self {
            compression,
            level,
            major,
            minor,
            before_hash,
            after_hash,
            created,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
