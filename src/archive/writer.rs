// Forward-only archive encoder.
//
// The prefix goes straight to the output; the header, path table, commands
// and end marker all pass through the body compressor. Commands must be
// written in path-table order and blobs are streamed, so a file payload is
// never held in memory.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};

use super::compression::Compressor;
use super::header::ArchiveHeader;
use super::{ArchiveError, MAX_LINK_TARGET_LEN, MAX_PATH_TABLE_ENTRIES, varint};
use crate::command::{Command, CommandFlags, PathTable, Payload};
use crate::tree::EntryKind;

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

pub struct ArchiveWriter<W: Write> {
    out: Compressor<W>,
    table: PathTable,
    written: usize,
}

impl<W: Write> ArchiveWriter<W> {
    /// Write the prefix, header and path table.
    pub fn new(mut inner: W, header: &ArchiveHeader, table: &PathTable) -> Result<Self, ArchiveError> {
        if table.len() as u64 > MAX_PATH_TABLE_ENTRIES {
            return Err(ArchiveError::TooManyFiles(table.len() as u64));
        }
        for path in table.paths() {
            super::validate_path(path)?;
        }

        header.write_prefix(&mut inner)?;
        let mut out = Compressor::new(inner, header.compression, header.level)?;
        header.write_body(&mut out)?;

        let table_len: usize = table.paths().iter().map(|p| p.len() + 1).sum();
        varint::write_usize(&mut out, table_len)?;
        for path in table.paths() {
            out.write_all(path.as_bytes())?;
            out.write_all(&[0])?;
        }
        varint::write_usize(&mut out, table.command_count())?;

        Ok(Self {
            out,
            table: table.clone(),
            written: 0,
        })
    }

    /// Number of commands written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Encode one command. Its path must be the next command path of the table.
    pub fn write_command(&mut self, cmd: &Command) -> Result<(), ArchiveError> {
        let expected = if self.written < self.table.command_count() {
            self.table.get(self.written)
        } else {
            None
        };
        if expected != Some(cmd.path.as_str()) {
            return Err(ArchiveError::CommandOutOfOrder {
                path: cmd.path.clone(),
                expected: expected.map(str::to_owned),
            });
        }
        if !cmd.flags.is_valid() {
            return Err(ArchiveError::InvalidCommand {
                path: cmd.path.clone(),
                flags: cmd.flags.bits(),
            });
        }

        let out = &mut self.out;
        out.write_all(&[cmd.flags.bits()])?;
        if cmd.flags.has_mode() {
            out.write_all(&cmd.mode.to_le_bytes())?;
        }

        if cmd.flags.contains(CommandFlags::CLONE) {
            let source = cmd
                .clone_source
                .as_deref()
                .ok_or_else(|| ArchiveError::MissingPayload(cmd.path.clone()))?;
            let index = self
                .table
                .index_of(source)
                .ok_or_else(|| ArchiveError::UnknownCloneSource(source.to_string()))?;
            varint::write_usize(out, index)?;
        }

        let diff = match (&cmd.payload, cmd.flags.contains(CommandFlags::BINARY_DIFF)) {
            (Payload::Diff(record), true) => {
                varint::write_usize(out, record.controls.len())?;
                Some(record)
            }
            (_, true) => return Err(ArchiveError::MissingPayload(cmd.path.clone())),
            _ => None,
        };

        if cmd.flags.contains(CommandFlags::EXTRACT) {
            let kind = EntryKind::from_mode(cmd.mode).ok_or_else(|| ArchiveError::InvalidCommand {
                path: cmd.path.clone(),
                flags: cmd.flags.bits(),
            })?;
            write_extract_blob(out, cmd, kind)?;
        }

        if let Some(record) = diff {
            varint::write_u64(out, record.new_len())?;
            varint::write_usize(out, record.diff.len())?;
            varint::write_usize(out, record.extra.len())?;
            out.write_all(&record.control_bytes())?;
            out.write_all(&record.diff)?;
            out.write_all(&record.extra)?;
        }

        log::debug!("wrote {} ({})", cmd.path, cmd.flags.describe());
        self.written += 1;
        Ok(())
    }

    /// Write the end marker and flush the compressor.
    pub fn finish(mut self) -> Result<W, ArchiveError> {
        if self.written != self.table.command_count() {
            return Err(ArchiveError::IncompleteCommands {
                written: self.written,
                expected: self.table.command_count(),
            });
        }
        self.out.write_all(&[0])?;
        Ok(self.out.finish()?)
    }
}

fn write_extract_blob<W: Write>(
    out: &mut Compressor<W>,
    cmd: &Command,
    kind: EntryKind,
) -> Result<(), ArchiveError> {
    match (kind, &cmd.payload) {
        (EntryKind::Directory, _) => Ok(()),
        (EntryKind::Symlink, Payload::Link(target)) => {
            let len = target.len() as u64;
            if len > MAX_LINK_TARGET_LEN {
                return Err(ArchiveError::LinkTooLong {
                    path: cmd.path.clone(),
                    len,
                });
            }
            varint::write_u64(out, len)?;
            out.write_all(target.as_bytes())?;
            Ok(())
        }
        (EntryKind::File, Payload::Inline(data)) => {
            varint::write_usize(out, data.len())?;
            out.write_all(data)?;
            Ok(())
        }
        (EntryKind::File, Payload::File(path)) => {
            let file = File::open(path)?;
            let len = file.metadata()?.len();
            varint::write_u64(out, len)?;
            let mut reader = BufReader::with_capacity(BUF_SIZE, file).take(len);
            let copied = io::copy(&mut reader, out)?;
            if copied != len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} shrank while being archived", path.display()),
                )
                .into());
            }
            Ok(())
        }
        _ => Err(ArchiveError::MissingPayload(cmd.path.clone())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::reader::ArchiveReader;
    use crate::archive::{CompressionMode, validate_path};
    use crate::bsdiff;
    use crate::tree::{MajorVersion, TreeHash};
    use std::ops::ControlFlow;

    fn header(mode: CompressionMode) -> ArchiveHeader {
        let mut h = ArchiveHeader::new(MajorVersion::V3, TreeHash([0xAA; 32]), TreeHash([0xBB; 32]));
        h.compression = mode;
        h.level = mode.default_level();
        h.created = Some(1_234_567);
        h
    }

    fn sample_commands() -> Vec<Command> {
        let record = bsdiff::diff(b"hello old world", b"hello new world!");
        vec![
            Command::new("bin", CommandFlags::EXTRACT).with_mode(0o040755),
            Command::new("bin/tool", CommandFlags::EXTRACT)
                .with_mode(0o100755)
                .with_payload(Payload::Inline(b"#!/bin/sh\necho hi\n".to_vec())),
            Command::new("copy.txt", CommandFlags::CLONE)
                .with_mode(0o644)
                .with_clone_source("orig.txt"),
            Command::new("doc.txt", CommandFlags::BINARY_DIFF | CommandFlags::MODIFY_PERMISSIONS)
                .with_mode(0o600)
                .with_payload(Payload::Diff(record)),
            Command::new("latest", CommandFlags::DELETE | CommandFlags::EXTRACT)
                .with_mode(0o120777)
                .with_payload(Payload::Link("bin/tool".into())),
            Command::new("old.txt", CommandFlags::DELETE),
        ]
    }

    fn encode(mode: CompressionMode, commands: &[Command]) -> Vec<u8> {
        let table = PathTable::for_commands(commands).unwrap();
        let mut w = ArchiveWriter::new(Vec::new(), &header(mode), &table).unwrap();
        for c in commands {
            w.write_command(c).unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn roundtrip_every_command_kind() {
        let commands = sample_commands();
        for mode in CompressionMode::ALL.into_iter().filter(|m| m.is_available()) {
            let bytes = encode(mode, &commands);
            let reader = ArchiveReader::new(&bytes[..]).unwrap();
            assert_eq!(*reader.header(), header(mode));
            assert_eq!(reader.path_table().len(), commands.len() + 1);

            let mut seen = Vec::new();
            reader
                .for_each_command(|item| -> Result<_, ArchiveError> {
                    let mut data = Vec::new();
                    match item.path() {
                        "bin/tool" => {
                            item.copy_to(&mut data)?;
                            assert_eq!(data, b"#!/bin/sh\necho hi\n");
                        }
                        "copy.txt" => assert_eq!(item.clone_source(), Some("orig.txt")),
                        "doc.txt" => {
                            let record = item.read_diff()?;
                            assert_eq!(record.apply(b"hello old world").unwrap(), b"hello new world!");
                            assert_eq!(item.permissions(), 0o600);
                        }
                        "latest" => assert_eq!(item.link_target(), Some("bin/tool")),
                        _ => {}
                    }
                    seen.push((item.path().to_string(), item.flags()));
                    Ok(ControlFlow::Continue(()))
                })
                .unwrap();
            let expected: Vec<_> = commands.iter().map(|c| (c.path.clone(), c.flags)).collect();
            assert_eq!(seen, expected, "mode {mode}");
        }
    }

    #[test]
    fn unread_blobs_are_skipped() {
        let bytes = encode(CompressionMode::None, &sample_commands());
        let mut count = 0;
        ArchiveReader::new(&bytes[..])
            .unwrap()
            .for_each_command(|_| -> Result<_, ArchiveError> {
                count += 1;
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(count, 6);
    }

    #[test]
    fn early_stop() {
        let bytes = encode(CompressionMode::None, &sample_commands());
        let mut count = 0;
        ArchiveReader::new(&bytes[..])
            .unwrap()
            .for_each_command(|_| -> Result<_, ArchiveError> {
                count += 1;
                Ok(if count == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn out_of_order_command_rejected() {
        let commands = sample_commands();
        let table = PathTable::for_commands(&commands).unwrap();
        let mut w = ArchiveWriter::new(Vec::new(), &header(CompressionMode::None), &table).unwrap();
        assert!(matches!(
            w.write_command(&commands[1]),
            Err(ArchiveError::CommandOutOfOrder { .. })
        ));
    }

    #[test]
    fn finish_requires_every_command() {
        let commands = sample_commands();
        let table = PathTable::for_commands(&commands).unwrap();
        let mut w = ArchiveWriter::new(Vec::new(), &header(CompressionMode::None), &table).unwrap();
        w.write_command(&commands[0]).unwrap();
        assert!(matches!(
            w.finish(),
            Err(ArchiveError::IncompleteCommands { written: 1, expected: 6 })
        ));
    }

    #[test]
    fn long_link_rejected() {
        let cmd = Command::new("l", CommandFlags::EXTRACT)
            .with_mode(0o120777)
            .with_payload(Payload::Link("x".repeat(5000)));
        let table = PathTable::for_commands(std::slice::from_ref(&cmd)).unwrap();
        let mut w = ArchiveWriter::new(Vec::new(), &header(CompressionMode::None), &table).unwrap();
        assert!(matches!(
            w.write_command(&cmd),
            Err(ArchiveError::LinkTooLong { len: 5000, .. })
        ));
    }

    #[test]
    fn table_paths_are_validated() {
        assert!(validate_path("ok/path").is_ok());
        let cmd = Command::new("../escape", CommandFlags::DELETE);
        let table = PathTable::for_commands(std::slice::from_ref(&cmd)).unwrap();
        assert!(matches!(
            ArchiveWriter::new(Vec::new(), &header(CompressionMode::None), &table),
            Err(ArchiveError::InvalidPath(_))
        ));
    }
}
