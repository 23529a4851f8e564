//! Block-compressed seekable backend.
//!
//! The physical file is a bare sequence of blocks, each
//! `{u32 compLen, u32 rawLen, u32 crc32(comp), compBytes}` with the payload
//! zstd-compressed. The logical stream is the concatenation of the raw
//! block contents; a trailer passed to `close` is ordinary logical data and
//! therefore lands in the final block(s).
//!
//! Write mode buffers raw bytes and emits a block whenever a full
//! [`RAW_BLOCK_SIZE`] is available. Read mode scans every block header once
//! at open to build an offset table, then serves `seek`/`read` in logical
//! offsets with a one-block decompression cache. A checksum or length
//! mismatch while loading a block is a corruption error, never a silent
//! truncation.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{Error, Result};
use crate::stream::{read_full, ByteStream};

/// Uncompressed bytes per block.
pub const RAW_BLOCK_SIZE: usize = 64 * 1024;
/// Default zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

const BLOCK_HEADER_SIZE: u64 = 12;

// ── Block table ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    /// Physical offset of the block header.
    phys:     u64,
    /// Logical offset of the block's first raw byte.
    raw_off:  u64,
    raw_len:  u32,
    comp_len: u32,
    crc:      u32,
}

// ── Stream ───────────────────────────────────────────────────────────────────

struct WriteState {
    file:        File,
    raw_buf:     Vec<u8>,
    flushed_raw: u64,
    level:       i32,
}

struct ReadState {
    file:        File,
    blocks:      Vec<BlockEntry>,
    logical_len: u64,
    pos:         u64,
    /// (block index, decompressed contents) of the most recent block.
    cache:       Option<(usize, Vec<u8>)>,
}

enum Inner {
    Write(WriteState),
    Read(ReadState),
    Closed,
}

/// Block-compressed [`ByteStream`] over a file, in either write or read
/// mode. Write-mode streams cannot seek; read-mode streams cannot write.
pub struct ZstdStream {
    inner: Inner,
}

impl ZstdStream {
    /// Create a new compressed stream for writing.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_level(path, DEFAULT_COMPRESSION_LEVEL)
    }

    pub fn create_with_level(path: impl AsRef<Path>, level: i32) -> Result<Self> {
        Ok(Self {
            inner: Inner::Write(WriteState {
                file:        File::create(path)?,
                raw_buf:     Vec::with_capacity(RAW_BLOCK_SIZE),
                flushed_raw: 0,
                level,
            }),
        })
    }

    /// Open an existing compressed stream for reading. Scans all block
    /// headers once to build the logical offset table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut blocks = Vec::new();
        let mut logical_len = 0u64;

        loop {
            let phys = file.stream_position()?;
            let mut header = [0u8; BLOCK_HEADER_SIZE as usize];
            let got = read_full(&mut file, &mut header)?;
            if got == 0 {
                break;
            }
            if got < header.len() {
                return Err(Error::corrupt(format!(
                    "truncated block header at physical offset {phys}"
                )));
            }
            let mut cur = &header[..];
            let comp_len = cur.read_u32::<LittleEndian>()?;
            let raw_len  = cur.read_u32::<LittleEndian>()?;
            let crc      = cur.read_u32::<LittleEndian>()?;

            file.seek(SeekFrom::Current(comp_len as i64))?;
            blocks.push(BlockEntry { phys, raw_off: logical_len, raw_len, comp_len, crc });
            logical_len += raw_len as u64;
        }

        Ok(Self {
            inner: Inner::Read(ReadState {
                file,
                blocks,
                logical_len,
                pos: 0,
                cache: None,
            }),
        })
    }

    /// Total logical (decompressed) length. Read mode only.
    pub fn logical_len(&self) -> Option<u64> {
        match &self.inner {
            Inner::Read(rs) => Some(rs.logical_len),
            _ => None,
        }
    }
}

// ── Write path ───────────────────────────────────────────────────────────────

impl WriteState {
    fn emit_block(&mut self, raw: &[u8]) -> Result<()> {
        let comp = zstd::encode_all(raw, self.level)
            .map_err(|e| Error::corrupt(format!("block compression failed: {e}")))?;
        let mut hasher = Hasher::new();
        hasher.update(&comp);

        self.file.write_u32::<LittleEndian>(comp.len() as u32)?;
        self.file.write_u32::<LittleEndian>(raw.len() as u32)?;
        self.file.write_u32::<LittleEndian>(hasher.finalize())?;
        self.file.write_all(&comp)?;
        self.flushed_raw += raw.len() as u64;
        Ok(())
    }

    fn drain_full_blocks(&mut self) -> Result<()> {
        while self.raw_buf.len() >= RAW_BLOCK_SIZE {
            let rest = self.raw_buf.split_off(RAW_BLOCK_SIZE);
            let block = std::mem::replace(&mut self.raw_buf, rest);
            self.emit_block(&block)?;
        }
        Ok(())
    }
}

// ── Read path ────────────────────────────────────────────────────────────────

impl ReadState {
    /// Index of the block containing logical offset `pos`, or `None` past
    /// the end.
    fn block_at(&self, pos: u64) -> Option<usize> {
        if pos >= self.logical_len {
            return None;
        }
        let idx = self
            .blocks
            .partition_point(|b| b.raw_off + b.raw_len as u64 <= pos);
        (idx < self.blocks.len()).then_some(idx)
    }

    fn ensure_cached(&mut self, idx: usize) -> Result<()> {
        if matches!(self.cache, Some((cached, _)) if cached == idx) {
            return Ok(());
        }
        let entry = self.blocks[idx];
        self.file.seek(SeekFrom::Start(entry.phys + BLOCK_HEADER_SIZE))?;
        let mut comp = vec![0u8; entry.comp_len as usize];
        if read_full(&mut self.file, &mut comp)? < comp.len() {
            return Err(Error::corrupt(format!(
                "block at physical offset {} truncated",
                entry.phys
            )));
        }

        let mut hasher = Hasher::new();
        hasher.update(&comp);
        if hasher.finalize() != entry.crc {
            return Err(Error::corrupt(format!(
                "block checksum mismatch at physical offset {}",
                entry.phys
            )));
        }

        let raw = zstd::decode_all(&comp[..])
            .map_err(|e| Error::corrupt(format!("block decompression failed: {e}")))?;
        if raw.len() != entry.raw_len as usize {
            return Err(Error::corrupt(format!(
                "block at physical offset {} declares {} raw bytes but holds {}",
                entry.phys,
                entry.raw_len,
                raw.len()
            )));
        }
        self.cache = Some((idx, raw));
        Ok(())
    }
}

// ── ByteStream impl ──────────────────────────────────────────────────────────

impl ByteStream for ZstdStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let rs = match &mut self.inner {
            Inner::Read(rs) => rs,
            Inner::Write(_) => return Err(unsupported("read on a write-mode block stream")),
            Inner::Closed => return Err(Error::Closed("block stream")),
        };

        let mut filled = 0usize;
        while filled < buf.len() {
            let idx = match rs.block_at(rs.pos) {
                Some(i) => i,
                None => break,
            };
            rs.ensure_cached(idx)?;
            let entry = rs.blocks[idx];
            let raw = match &rs.cache {
                Some((_, raw)) => raw,
                None => return Err(Error::corrupt("block cache missing after load")),
            };
            let within = (rs.pos - entry.raw_off) as usize;
            let n = (buf.len() - filled).min(raw.len() - within);
            buf[filled..filled + n].copy_from_slice(&raw[within..within + n]);
            filled += n;
            rs.pos += n as u64;
        }
        Ok(filled)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let ws = match &mut self.inner {
            Inner::Write(ws) => ws,
            Inner::Read(_) => return Err(unsupported("write on a read-mode block stream")),
            Inner::Closed => return Err(Error::Closed("block stream")),
        };
        ws.raw_buf.extend_from_slice(buf);
        ws.drain_full_blocks()
    }

    fn tell(&mut self) -> Result<u64> {
        match &mut self.inner {
            Inner::Write(ws) => Ok(ws.flushed_raw + ws.raw_buf.len() as u64),
            Inner::Read(rs) => Ok(rs.pos),
            Inner::Closed => Err(Error::Closed("block stream")),
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let rs = match &mut self.inner {
            Inner::Read(rs) => rs,
            Inner::Write(_) => return Err(unsupported("seek on a write-mode block stream")),
            Inner::Closed => return Err(Error::Closed("block stream")),
        };
        let target = match pos {
            SeekFrom::Start(o) => o as i128,
            SeekFrom::Current(d) => rs.pos as i128 + d as i128,
            SeekFrom::End(d) => rs.logical_len as i128 + d as i128,
        };
        if target < 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before logical start",
            )));
        }
        rs.pos = target as u64;
        Ok(rs.pos)
    }

    fn close(&mut self, trailer: Option<&[u8]>) -> Result<()> {
        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Write(mut ws) => {
                if let Some(bytes) = trailer {
                    ws.raw_buf.extend_from_slice(bytes);
                }
                ws.drain_full_blocks()?;
                if !ws.raw_buf.is_empty() {
                    let last = std::mem::take(&mut ws.raw_buf);
                    ws.emit_block(&last)?;
                }
                ws.file.flush()?;
                Ok(())
            }
            Inner::Read(_) => {
                if trailer.is_some() {
                    return Err(unsupported("trailer on a read-mode block stream"));
                }
                Ok(())
            }
            Inner::Closed => Err(Error::Closed("block stream")),
        }
    }
}

fn unsupported(msg: &str) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Unsupported, msg))
}
