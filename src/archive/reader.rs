// Forward-only archive decoder.
//
// The reader parses the prefix, header and path table on construction and
// then hands out commands one at a time, strictly in file order. A command's
// blob can only be consumed while the callback holds its `ArchiveItem`;
// whatever the callback leaves unread is skipped before the next command.
//
// Offsets in errors count bytes of the decompressed body, starting right
// after the 6-byte prefix.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::mem;
use std::ops::ControlFlow;
use std::path::Path;

use super::compression::Decompressor;
use super::header::ArchiveHeader;
use super::{
    ArchiveError, MAX_LINK_TARGET_LEN, MAX_PATH_TABLE_BYTES, MAX_PATH_TABLE_ENTRIES, validate_path,
    varint,
};
use crate::bsdiff::DiffRecord;
use crate::bsdiff::control::{ControlTriple, TRIPLE_LEN};
use crate::command::{CommandFlags, PathTable};
use crate::tree::EntryKind;

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

// ---------------------------------------------------------------------------
// CountingReader
// ---------------------------------------------------------------------------

/// Byte-counting reader with typed field helpers.
///
/// A stream that ends inside a field is reported as `BadChunkSize` at the
/// offset where the field started.
pub struct CountingReader<R: Read> {
    inner: R,
    offset: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn field_error(&self, start: u64, what: &'static str, e: io::Error) -> ArchiveError {
        match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
                ArchiveError::BadChunkSize { offset: start, what }
            }
            _ => ArchiveError::Io(e),
        }
    }

    pub fn read_array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], ArchiveError> {
        let start = self.offset;
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)
            .map_err(|e| self.field_error(start, what, e))?;
        Ok(buf)
    }

    pub fn read_u8(&mut self, what: &'static str) -> Result<u8, ArchiveError> {
        Ok(self.read_array::<1>(what)?[0])
    }

    pub fn read_u16(&mut self, what: &'static str) -> Result<u16, ArchiveError> {
        Ok(u16::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_varint(&mut self, what: &'static str) -> Result<u64, ArchiveError> {
        let start = self.offset;
        varint::read_u64(self).map_err(|e| self.field_error(start, what, e))
    }

    /// Read exactly `len` bytes, never allocating more than the stream holds.
    pub fn read_vec(&mut self, len: u64, what: &'static str) -> Result<Vec<u8>, ArchiveError> {
        let start = self.offset;
        let mut out = Vec::with_capacity(len.min(BUF_SIZE as u64) as usize);
        self.by_ref().take(len).read_to_end(&mut out)?;
        if out.len() as u64 != len {
            return Err(ArchiveError::BadChunkSize { offset: start, what });
        }
        Ok(out)
    }

    /// Copy exactly `len` bytes into `w`.
    pub fn copy_exact<W: Write + ?Sized>(
        &mut self,
        len: u64,
        w: &mut W,
        what: &'static str,
    ) -> Result<u64, ArchiveError> {
        let start = self.offset;
        let n = io::copy(&mut self.by_ref().take(len), w)?;
        if n != len {
            return Err(ArchiveError::BadChunkSize { offset: start, what });
        }
        Ok(n)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// ArchiveItem
// ---------------------------------------------------------------------------

enum Blob {
    None,
    File {
        remaining: u64,
    },
    Diff {
        controls: Vec<ControlTriple>,
        diff_len: u64,
        extra_len: u64,
        consumed: bool,
    },
}

/// One decoded command, valid for the duration of a callback.
pub struct ArchiveItem<'a, S: Read> {
    path: &'a str,
    flags: CommandFlags,
    mode: u16,
    clone_source: Option<&'a str>,
    link_target: Option<String>,
    new_len: Option<u64>,
    blob: Blob,
    input: &'a mut CountingReader<S>,
}

impl<S: Read> ArchiveItem<'_, S> {
    pub fn path(&self) -> &str {
        self.path
    }

    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    /// Raw mode field: type and permission bits for Extract, permission
    /// bits for Clone and ModifyPermissions, zero otherwise.
    pub fn mode(&self) -> u16 {
        self.mode
    }

    pub fn permissions(&self) -> u16 {
        self.mode & 0o7777
    }

    /// Kind of the extracted entry.
    pub fn kind(&self) -> Option<EntryKind> {
        if self.flags.contains(CommandFlags::EXTRACT) {
            EntryKind::from_mode(self.mode)
        } else {
            None
        }
    }

    pub fn clone_source(&self) -> Option<&str> {
        self.clone_source
    }

    pub fn link_target(&self) -> Option<&str> {
        self.link_target.as_deref()
    }

    /// Length of an extracted file, or of the file a diff rebuilds.
    pub fn content_len(&self) -> Option<u64> {
        match &self.blob {
            Blob::File { .. } => self.new_len,
            Blob::Diff { .. } => self.new_len,
            Blob::None => None,
        }
    }

    /// Stream the contents of an extracted file into `w`.
    pub fn copy_to<W: Write + ?Sized>(&mut self, w: &mut W) -> Result<u64, ArchiveError> {
        match &mut self.blob {
            Blob::File { remaining } => {
                let len = mem::take(remaining);
                self.input.copy_exact(len, w, "truncated file data")
            }
            _ => Err(ArchiveError::MissingPayload(self.path.to_string())),
        }
    }

    /// Read the diff record of a BinaryDiff command.
    pub fn read_diff(&mut self) -> Result<DiffRecord, ArchiveError> {
        match &mut self.blob {
            Blob::Diff {
                controls,
                diff_len,
                extra_len,
                consumed,
            } if !*consumed => {
                *consumed = true;
                let diff = self.input.read_vec(*diff_len, "truncated diff data")?;
                let extra = self.input.read_vec(*extra_len, "truncated extra data")?;
                Ok(DiffRecord {
                    controls: mem::take(controls),
                    diff,
                    extra,
                })
            }
            _ => Err(ArchiveError::MissingPayload(self.path.to_string())),
        }
    }

    fn skip_rest(&mut self) -> Result<(), ArchiveError> {
        let pending = match &mut self.blob {
            Blob::File { remaining } => mem::take(remaining),
            Blob::Diff {
                diff_len,
                extra_len,
                consumed,
                ..
            } if !*consumed => {
                *consumed = true;
                *diff_len + *extra_len
            }
            _ => 0,
        };
        if pending > 0 {
            self.input
                .copy_exact(pending, &mut io::sink(), "truncated command data")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ArchiveReader
// ---------------------------------------------------------------------------

pub struct ArchiveReader<R: BufRead> {
    input: CountingReader<Decompressor<R>>,
    header: ArchiveHeader,
    table: PathTable,
}

impl ArchiveReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        Self::new(BufReader::with_capacity(BUF_SIZE, file))
    }
}

impl<R: BufRead> ArchiveReader<R> {
    /// Parse the prefix, header and path table.
    pub fn new(mut inner: R) -> Result<Self, ArchiveError> {
        let (mode, level) = ArchiveHeader::read_prefix(&mut inner)?;
        let mut input = CountingReader::new(Decompressor::new(inner, mode)?);
        let header = ArchiveHeader::read_body(&mut input, mode, level)?;
        let table = read_path_table(&mut input)?;
        log::debug!(
            "archive v{}.{} {} level {}: {} paths, {} commands",
            header.major,
            header.minor,
            header.compression,
            header.level,
            table.len(),
            table.command_count()
        );
        Ok(Self {
            input,
            header,
            table,
        })
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    pub fn path_table(&self) -> &PathTable {
        &self.table
    }

    pub fn command_count(&self) -> usize {
        self.table.command_count()
    }

    /// Decode every command in order, handing each to `f`.
    ///
    /// Returning `ControlFlow::Break` stops decoding early; the rest of the
    /// archive, end marker included, is then left unread.
    pub fn for_each_command<F, E>(mut self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&mut ArchiveItem<'_, Decompressor<R>>) -> Result<ControlFlow<()>, E>,
        E: From<ArchiveError>,
    {
        for index in 0..self.table.command_count() {
            let mut item = read_command(&mut self.input, &self.table, index)?;
            let flow = f(&mut item)?;
            item.skip_rest()?;
            if flow.is_break() {
                return Ok(());
            }
        }

        let offset = self.input.offset();
        if self.input.read_u8("end marker")? != 0 {
            return Err(ArchiveError::BadChunkSize {
                offset,
                what: "more commands than declared",
            }
            .into());
        }
        Ok(())
    }
}

/// Read the header of the archive at `path`.
pub fn read_header(path: &Path) -> Result<ArchiveHeader, ArchiveError> {
    Ok(ArchiveReader::open(path)?.header)
}

fn read_path_table<S: Read>(input: &mut CountingReader<S>) -> Result<PathTable, ArchiveError> {
    let offset = input.offset();
    let len = input.read_varint("path table length")?;
    if len > MAX_PATH_TABLE_BYTES {
        return Err(ArchiveError::BadChunkSize {
            offset,
            what: "path table too large",
        });
    }
    let bytes = input.read_vec(len, "truncated path table")?;
    if bytes.last().is_some_and(|&b| b != 0) {
        return Err(ArchiveError::BadChunkSize {
            offset,
            what: "unterminated path table",
        });
    }

    let entries = bytes.iter().filter(|&&b| b == 0).count() as u64;
    if entries > MAX_PATH_TABLE_ENTRIES {
        return Err(ArchiveError::TooManyFiles(entries));
    }

    let mut paths = Vec::with_capacity(entries as usize);
    let mut seen = HashSet::with_capacity(entries as usize);
    if let Some((_, body)) = bytes.split_last() {
        for raw in body.split(|&b| b == 0) {
            let path = std::str::from_utf8(raw)
                .map_err(|_| ArchiveError::InvalidPath(String::from_utf8_lossy(raw).into_owned()))?;
            validate_path(path)?;
            if !seen.insert(path) {
                return Err(ArchiveError::InvalidPath(path.to_string()));
            }
            paths.push(path.to_string());
        }
    }

    let offset = input.offset();
    let count = input.read_varint("command count")?;
    if count > MAX_PATH_TABLE_ENTRIES {
        return Err(ArchiveError::TooManyFiles(count));
    }
    if count > paths.len() as u64 {
        return Err(ArchiveError::BadChunkSize {
            offset,
            what: "command count exceeds path table",
        });
    }
    Ok(PathTable::from_parts(paths, count as usize))
}

fn read_command<'a, S: Read>(
    input: &'a mut CountingReader<S>,
    table: &'a PathTable,
    index: usize,
) -> Result<ArchiveItem<'a, S>, ArchiveError> {
    let path: &'a str = table.paths()[index].as_str();
    let offset = input.offset();
    let raw = input.read_u8("command flags")?;
    if raw == 0 {
        return Err(ArchiveError::BadChunkSize {
            offset,
            what: "fewer commands than declared",
        });
    }
    let flags = CommandFlags::from_bits_retain(raw);
    let invalid = || ArchiveError::InvalidCommand {
        path: path.to_string(),
        flags: raw,
    };
    if !flags.is_valid() {
        return Err(invalid());
    }

    let mode = if flags.has_mode() {
        input.read_u16("command mode")?
    } else {
        0
    };

    let clone_source = if flags.contains(CommandFlags::CLONE) {
        let offset = input.offset();
        let idx = input.read_varint("clone index")?;
        let source = usize::try_from(idx)
            .ok()
            .and_then(|i| table.get(i))
            .ok_or(ArchiveError::BadCloneLookup { index: idx, offset })?;
        Some(source)
    } else {
        None
    };

    let triple_count = if flags.contains(CommandFlags::BINARY_DIFF) {
        Some(input.read_varint("triple count")?)
    } else {
        None
    };

    let mut blob = Blob::None;
    let mut link_target = None;
    let mut new_len = None;

    if flags.contains(CommandFlags::EXTRACT) {
        match EntryKind::from_mode(mode).ok_or_else(invalid)? {
            EntryKind::File => {
                let len = input.read_varint("file length")?;
                new_len = Some(len);
                blob = Blob::File { remaining: len };
            }
            EntryKind::Symlink => {
                let len = input.read_varint("link length")?;
                if len > MAX_LINK_TARGET_LEN {
                    return Err(ArchiveError::LinkTooLong {
                        path: path.to_string(),
                        len,
                    });
                }
                let offset = input.offset();
                let bytes = input.read_vec(len, "truncated link target")?;
                let target = String::from_utf8(bytes).map_err(|_| ArchiveError::BadChunkSize {
                    offset,
                    what: "link target is not UTF-8",
                })?;
                link_target = Some(target);
            }
            EntryKind::Directory => {}
        }
    }

    if let Some(count) = triple_count {
        let offset = input.offset();
        let declared_new = input.read_varint("diff output length")?;
        let diff_len = input.read_varint("diff length")?;
        let extra_len = input.read_varint("extra length")?;

        let mut controls = Vec::new();
        let (mut copy_sum, mut extra_sum) = (0u64, 0u64);
        for _ in 0..count {
            let triple = ControlTriple::decode(&input.read_array::<TRIPLE_LEN>("truncated control triples")?);
            if triple.copy_len < 0 || triple.extra_len < 0 {
                return Err(ArchiveError::BadChunkSize {
                    offset,
                    what: "negative length in control triple",
                });
            }
            copy_sum = copy_sum.saturating_add(triple.copy_len as u64);
            extra_sum = extra_sum.saturating_add(triple.extra_len as u64);
            controls.push(triple);
        }
        if copy_sum != diff_len
            || extra_sum != extra_len
            || copy_sum.checked_add(extra_sum) != Some(declared_new)
        {
            return Err(ArchiveError::BadChunkSize {
                offset,
                what: "diff section sizes disagree",
            });
        }
        new_len = Some(declared_new);
        blob = Blob::Diff {
            controls,
            diff_len,
            extra_len,
            consumed: false,
        };
    }

    Ok(ArchiveItem {
        path,
        flags,
        mode,
        clone_source,
        link_target,
        new_len,
        blob,
        input,
    })
}
