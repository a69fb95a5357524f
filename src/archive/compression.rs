// Compression of the archive body.
//
// Everything after the 6-byte prefix passes through one compressor. Mode
// numbers are part of the format:
//
//   0 = none
//   1 = bzip2  (reserved, rejected)
//   2 = LZMA   (lzma-rs, feature `lzma`)
//   3 = LZFSE  (reserved, rejected)
//   4 = LZ4    (reserved, rejected)
//   5 = zlib   (flate2, feature `zlib`)
//   6 = zstd   (zstd, feature `zstd`)
//
// LZMA bodies decode incrementally through lzma-rs' push decoder, fed a
// small slice at a time with its dictionary capped by `LZMA_MEMLIMIT`. The
// lzma-rs encoder only pulls from a reader, so bodies being written are
// staged in memory up to `MAX_LZMA_STAGED` bytes and compressed on finish.

use std::fmt;
use std::io::{self, BufRead, Read, Write};

use super::ArchiveError;

/// Largest LZMA body the writer stages before compressing.
pub const MAX_LZMA_STAGED: usize = 1 << 30; // 1 GiB

/// Dictionary memory the LZMA decoder may use.
pub const LZMA_MEMLIMIT: usize = 64 << 20; // 64 MiB

/// Compressed bytes handed to the LZMA decoder per step.
#[cfg(feature = "lzma")]
const LZMA_FEED: usize = 4096;

/// Body compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionMode {
    None,
    Lzma,
    #[default]
    Zlib,
    Zstd,
}

impl CompressionMode {
    pub const ALL: [CompressionMode; 4] = [
        CompressionMode::None,
        CompressionMode::Lzma,
        CompressionMode::Zlib,
        CompressionMode::Zstd,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            CompressionMode::None => 0,
            CompressionMode::Lzma => 2,
            CompressionMode::Zlib => 5,
            CompressionMode::Zstd => 6,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, ArchiveError> {
        match value {
            0 => Ok(CompressionMode::None),
            2 => Ok(CompressionMode::Lzma),
            5 => Ok(CompressionMode::Zlib),
            6 => Ok(CompressionMode::Zstd),
            other => Err(ArchiveError::BadCompressionValue(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionMode::None => "none",
            CompressionMode::Lzma => "lzma",
            CompressionMode::Zlib => "zlib",
            CompressionMode::Zstd => "zstd",
        }
    }

    /// Level used when the caller does not pick one.
    pub fn default_level(self) -> u8 {
        match self {
            CompressionMode::None | CompressionMode::Lzma => 0,
            CompressionMode::Zlib => 9,
            CompressionMode::Zstd => 19,
        }
    }

    /// Highest accepted level. LZMA accepts but ignores 0..=9.
    pub fn max_level(self) -> u8 {
        match self {
            CompressionMode::None => 0,
            CompressionMode::Lzma | CompressionMode::Zlib => 9,
            CompressionMode::Zstd => 22,
        }
    }

    /// Whether this build can read and write the mode.
    pub fn is_available(self) -> bool {
        match self {
            CompressionMode::None => true,
            CompressionMode::Lzma => cfg!(feature = "lzma"),
            CompressionMode::Zlib => cfg!(feature = "zlib"),
            CompressionMode::Zstd => cfg!(feature = "zstd"),
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Compressor
// ---------------------------------------------------------------------------

/// Streaming compressor over the archive body.
pub enum Compressor<W: Write> {
    Plain(W),
    #[cfg(feature = "lzma")]
    Lzma { inner: W, staged: Vec<u8> },
    #[cfg(feature = "zlib")]
    Zlib(flate2::write::ZlibEncoder<W>),
    #[cfg(feature = "zstd")]
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Compressor<W> {
    pub fn new(inner: W, mode: CompressionMode, level: u8) -> Result<Self, ArchiveError> {
        if level > mode.max_level() {
            return Err(ArchiveError::BadCompressionLevel { mode, level });
        }
        match mode {
            CompressionMode::None => Ok(Compressor::Plain(inner)),
            #[cfg(feature = "lzma")]
            CompressionMode::Lzma => Ok(Compressor::Lzma {
                inner,
                staged: Vec::new(),
            }),
            #[cfg(feature = "zlib")]
            CompressionMode::Zlib => Ok(Compressor::Zlib(flate2::write::ZlibEncoder::new(
                inner,
                flate2::Compression::new(u32::from(level)),
            ))),
            #[cfg(feature = "zstd")]
            CompressionMode::Zstd => Ok(Compressor::Zstd(zstd::stream::write::Encoder::new(
                inner,
                i32::from(level),
            )?)),
            #[allow(unreachable_patterns)]
            other => Err(ArchiveError::CompressionUnavailable(other)),
        }
    }

    /// Flush all pending output and return the underlying writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Compressor::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            #[cfg(feature = "lzma")]
            Compressor::Lzma { mut inner, staged } => {
                lzma_rs::lzma_compress(&mut io::Cursor::new(staged), &mut inner)?;
                inner.flush()?;
                Ok(inner)
            }
            #[cfg(feature = "zlib")]
            Compressor::Zlib(enc) => {
                let mut w = enc.finish()?;
                w.flush()?;
                Ok(w)
            }
            #[cfg(feature = "zstd")]
            Compressor::Zstd(enc) => {
                let mut w = enc.finish()?;
                w.flush()?;
                Ok(w)
            }
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Plain(w) => w.write(buf),
            #[cfg(feature = "lzma")]
            Compressor::Lzma { staged, .. } => {
                if staged.len() + buf.len() > MAX_LZMA_STAGED {
                    return Err(io::Error::other(format!(
                        "LZMA body exceeds {MAX_LZMA_STAGED} bytes; use zlib or zstd"
                    )));
                }
                staged.extend_from_slice(buf);
                Ok(buf.len())
            }
            #[cfg(feature = "zlib")]
            Compressor::Zlib(enc) => enc.write(buf),
            #[cfg(feature = "zstd")]
            Compressor::Zstd(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Plain(w) => w.flush(),
            #[cfg(feature = "lzma")]
            Compressor::Lzma { .. } => Ok(()),
            #[cfg(feature = "zlib")]
            Compressor::Zlib(enc) => enc.flush(),
            #[cfg(feature = "zstd")]
            Compressor::Zstd(enc) => enc.flush(),
        }
    }
}

// ---------------------------------------------------------------------------
// Decompressor
// ---------------------------------------------------------------------------

/// Streaming decompressor over the archive body.
pub enum Decompressor<R: BufRead> {
    Plain(R),
    #[cfg(feature = "lzma")]
    Lzma(LzmaReader<R>),
    #[cfg(feature = "zlib")]
    Zlib(flate2::bufread::ZlibDecoder<R>),
    #[cfg(feature = "zstd")]
    Zstd(zstd::stream::read::Decoder<'static, R>),
}

impl<R: BufRead> Decompressor<R> {
    pub fn new(inner: R, mode: CompressionMode) -> Result<Self, ArchiveError> {
        match mode {
            CompressionMode::None => Ok(Decompressor::Plain(inner)),
            #[cfg(feature = "lzma")]
            CompressionMode::Lzma => Ok(Decompressor::Lzma(LzmaReader::new(inner))),
            #[cfg(feature = "zlib")]
            CompressionMode::Zlib => Ok(Decompressor::Zlib(flate2::bufread::ZlibDecoder::new(
                inner,
            ))),
            #[cfg(feature = "zstd")]
            CompressionMode::Zstd => Ok(Decompressor::Zstd(
                zstd::stream::read::Decoder::with_buffer(inner)?,
            )),
            #[allow(unreachable_patterns)]
            other => Err(ArchiveError::CompressionUnavailable(other)),
        }
    }
}

impl<R: BufRead> Read for Decompressor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decompressor::Plain(r) => r.read(buf),
            #[cfg(feature = "lzma")]
            Decompressor::Lzma(r) => r.read(buf),
            #[cfg(feature = "zlib")]
            Decompressor::Zlib(d) => d.read(buf),
            #[cfg(feature = "zstd")]
            Decompressor::Zstd(d) => d.read(buf),
        }
    }
}

/// Pull adapter over the lzma-rs push decoder.
///
/// Decoded bytes surface whenever the decoder flushes its dictionary, so
/// `pending` never holds more than the dictionary size.
#[cfg(feature = "lzma")]
pub struct LzmaReader<R: BufRead> {
    inner: R,
    stream: Option<lzma_rs::decompress::Stream<Vec<u8>>>,
    pending: Vec<u8>,
    pos: usize,
}

#[cfg(feature = "lzma")]
impl<R: BufRead> LzmaReader<R> {
    fn new(inner: R) -> Self {
        let options = lzma_rs::decompress::Options {
            memlimit: Some(LZMA_MEMLIMIT),
            ..Default::default()
        };
        Self {
            inner,
            stream: Some(lzma_rs::decompress::Stream::new_with_options(
                &options,
                Vec::new(),
            )),
            pending: Vec::new(),
            pos: 0,
        }
    }
}

#[cfg(feature = "lzma")]
impl<R: BufRead> Read for LzmaReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.pos);
                buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            let Some(stream) = self.stream.as_mut() else {
                return Ok(0);
            };
            self.pending.clear();
            self.pos = 0;

            let chunk = self.inner.fill_buf()?;
            if chunk.is_empty() {
                if let Some(stream) = self.stream.take() {
                    self.pending = stream.finish().map_err(|e| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("LZMA decompression failed: {e}"),
                        )
                    })?;
                }
                continue;
            }
            let n = chunk.len().min(LZMA_FEED);
            stream.write_all(&chunk[..n])?;
            self.inner.consume(n);
            if let Some(out) = stream.get_output_mut() {
                std::mem::swap(&mut self.pending, out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(mode: CompressionMode) {
        let data: Vec<u8> = b"Hello, world! This is test data. "
            .iter()
            .copied()
            .cycle()
            .take(8192)
            .collect();
        let mut enc = Compressor::new(Vec::new(), mode, mode.default_level()).unwrap();
        for chunk in data.chunks(1000) {
            enc.write_all(chunk).unwrap();
        }
        let compressed = enc.finish().unwrap();
        if mode != CompressionMode::None {
            assert!(compressed.len() < data.len(), "{mode} did not compress");
        }

        let mut dec = Decompressor::new(&compressed[..], mode).unwrap();
        let mut out = Vec::new();
        dec.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn available_modes_roundtrip() {
        for mode in CompressionMode::ALL {
            if mode.is_available() {
                roundtrip(mode);
            }
        }
    }

    #[test]
    fn mode_numbers() {
        for mode in CompressionMode::ALL {
            assert_eq!(CompressionMode::from_u8(mode.as_u8()).unwrap(), mode);
        }
        for bad in [1u8, 3, 4, 7, 255] {
            assert!(matches!(
                CompressionMode::from_u8(bad),
                Err(ArchiveError::BadCompressionValue(v)) if v == bad
            ));
        }
    }

    #[test]
    fn level_out_of_range_rejected() {
        assert!(matches!(
            Compressor::new(Vec::new(), CompressionMode::Zlib, 10),
            Err(ArchiveError::BadCompressionLevel { .. })
        ));
        assert!(matches!(
            Compressor::new(Vec::new(), CompressionMode::None, 1),
            Err(ArchiveError::BadCompressionLevel { .. })
        ));
    }

    #[cfg(feature = "lzma")]
    #[test]
    fn lzma_decodes_in_small_reads() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 253) as u8).collect();
        let mut enc = Compressor::new(Vec::new(), CompressionMode::Lzma, 0).unwrap();
        enc.write_all(&data).unwrap();
        let compressed = enc.finish().unwrap();

        // One byte per fill_buf exercises the decoder's input buffering.
        let source = io::BufReader::with_capacity(1, &compressed[..]);
        let mut dec = Decompressor::new(source, CompressionMode::Lzma).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 333];
        loop {
            let n = dec.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
    }

    #[cfg(feature = "lzma")]
    #[test]
    fn corrupt_lzma_body_is_an_error() {
        let mut dec =
            Decompressor::new(&b"\xff\xff\xff\xff\xff not lzma"[..], CompressionMode::Lzma).unwrap();
        let mut out = Vec::new();
        assert!(dec.read_to_end(&mut out).is_err());
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn corrupt_zlib_body_is_an_error() {
        let mut dec = Decompressor::new(&b"definitely not zlib"[..], CompressionMode::Zlib).unwrap();
        let mut out = Vec::new();
        assert!(dec.read_to_end(&mut out).is_err());
    }
}
