//! Seekable byte-stream collaborators.
//!
//! The container core frames and decodes records over a *logical* byte
//! sequence and never compresses anything itself. [`ByteStream`] is that
//! seam: `read`/`write`/`tell`/`seek` operate in logical (decompressed)
//! offsets, and `close` appends an optional trailer verbatim as the final
//! logical bytes before finalizing the backend.
//!
//! Two backends ship here: [`FileStream`] (plain file, logical = physical)
//! and [`block::ZstdStream`] (block-compressed). In-memory cursors also
//! implement the trait for tests and benches.

pub mod block;

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// A random-access logical byte sequence.
///
/// All offsets are logical. Implementations are blocking and carry no
/// internal synchronization; one stream belongs to one owner.
pub trait ByteStream {
    /// Fill as much of `buf` as possible from the cursor onward. Returns
    /// the number of bytes read; fewer than `buf.len()` only at end of
    /// stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Append/overwrite bytes at the cursor.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Current logical offset.
    fn tell(&mut self) -> Result<u64>;

    /// Reposition the cursor; returns the new logical offset.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Append `trailer` (if any) as the last logical bytes, then finalize.
    /// The stream is unusable afterwards.
    fn close(&mut self, trailer: Option<&[u8]>) -> Result<()>;
}

impl<T: ByteStream + ?Sized> ByteStream for &mut T {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write(buf)
    }
    fn tell(&mut self) -> Result<u64> {
        (**self).tell()
    }
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (**self).seek(pos)
    }
    fn close(&mut self, trailer: Option<&[u8]>) -> Result<()> {
        (**self).close(trailer)
    }
}

/// Read until `buf` is full or EOF, tolerating short reads from the OS.
pub(crate) fn read_full<R: Read>(mut src: R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(filled)
}

// ── Plain file backend ───────────────────────────────────────────────────────

/// Uncompressed file backend: the logical stream is the file itself.
pub struct FileStream {
    file:   File,
    closed: bool,
}

impl FileStream {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { file: File::create(path)?, closed: false })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { file: File::open(path)?, closed: false })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed("file stream"));
        }
        Ok(())
    }
}

impl ByteStream for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        read_full(&mut self.file, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.check_open()?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        self.check_open()?;
        Ok(self.file.stream_position()?)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.check_open()?;
        Ok(self.file.seek(pos)?)
    }

    fn close(&mut self, trailer: Option<&[u8]>) -> Result<()> {
        self.check_open()?;
        if let Some(bytes) = trailer {
            self.file.seek(SeekFrom::End(0))?;
            self.file.write_all(bytes)?;
        }
        self.file.flush()?;
        self.closed = true;
        Ok(())
    }
}

// ── In-memory backend (tests, benches) ───────────────────────────────────────

impl ByteStream for Cursor<Vec<u8>> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        read_full(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        Write::write_all(self, buf)?;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.position())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(Seek::seek(self, pos)?)
    }

    fn close(&mut self, trailer: Option<&[u8]>) -> Result<()> {
        if let Some(bytes) = trailer {
            Seek::seek(self, SeekFrom::End(0))?;
            Write::write_all(self, bytes)?;
        }
        Ok(())
    }
}
