//! Record container engine — writer and reader.
//!
//! # Writer
//! [`ZrecWriter`] writes the scheme header immediately at open, then turns
//! per-record field values into length-prefixed frames. Frames accumulate
//! in a pending buffer that is flushed to the underlying stream whenever it
//! exceeds [`FLUSH_THRESHOLD`] bytes and on close; flush timing is an
//! amortization detail, not part of the file format. `close` finalizes the
//! stream with the total entry count as an 8-byte trailer.
//!
//! # Reader
//! [`ZrecReader`] probes the trailing entry count via a seek-from-end,
//! parses the scheme header, and remembers the post-header offset as the
//! reset position. Records can then be read sequentially in batches, via
//! lazy restartable iterators, or at arbitrary byte offsets previously
//! obtained from this reader (offsets from anywhere else are not validated
//! and may decode garbage). Running out of records yields a short batch,
//! never an error.
//!
//! A record is atomic: a frame either lands in the pending buffer whole or
//! not at all. Both halves sit on top of [`ByteStream`] and never touch
//! compression themselves.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, trace};
use serde::Serialize;

use crate::codec::{DynCodec, JsonDynCodec};
use crate::error::{Error, Result};
use crate::scheme::Scheme;
use crate::stream::block::ZstdStream;
use crate::stream::ByteStream;
use crate::value::Value;

/// Pending-buffer flush threshold in bytes.
pub const FLUSH_THRESHOLD: usize = 2000;
/// Records pulled per iterator step; a tuning choice, not a contract.
pub(crate) const DEFAULT_BATCH: usize = 100;

const TRAILER_SIZE: u64 = 8;

// ── Records ──────────────────────────────────────────────────────────────────

/// Named field values for one write. Fields absent from the builder take
/// their tag's default; field names not in the scheme are ignored, matching
/// the container's named-write contract.
#[derive(Debug, Default, Clone)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }
}

/// One decoded record in scheme order, annotated with the byte offset at
/// which its frame began.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub offset: u64,
    pub values: Vec<Value>,
}

/// One decoded record keyed by field name, annotated like [`Entry`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedEntry {
    pub offset: u64,
    pub fields: HashMap<String, Value>,
}

impl NamedEntry {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct ZrecWriter<S: ByteStream> {
    stream:      S,
    scheme:      Scheme,
    dyn_codec:   Box<dyn DynCodec>,
    pending:     Vec<u8>,
    entry_count: u64,
    closed:      bool,
}

impl ZrecWriter<ZstdStream> {
    /// Create a new container at `path` over a block-compressed stream.
    pub fn create(path: impl AsRef<Path>, scheme: Scheme) -> Result<Self> {
        Self::new(ZstdStream::create(path)?, scheme)
    }
}

impl<S: ByteStream> ZrecWriter<S> {
    /// Start a container on `stream`: writes the scheme header immediately
    /// and initializes an empty pending buffer and a zero entry counter.
    pub fn new(stream: S, scheme: Scheme) -> Result<Self> {
        Self::with_dyn_codec(stream, scheme, Box::new(JsonDynCodec))
    }

    /// Like [`ZrecWriter::new`] with a custom dynamic-payload codec. The
    /// reader must be given the matching codec.
    pub fn with_dyn_codec(
        mut stream: S,
        scheme: Scheme,
        dyn_codec: Box<dyn DynCodec>,
    ) -> Result<Self> {
        let header = scheme.to_bytes()?;
        stream.write(&header)?;
        Ok(Self {
            stream,
            scheme,
            dyn_codec,
            pending: Vec::new(),
            entry_count: 0,
            closed: false,
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// Records written so far, independent of flushing.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed("writer"));
        }
        Ok(())
    }

    /// Write one record from positional values, one per scheme field.
    ///
    /// Every field is encoded into a scratch buffer first, so a shape
    /// mismatch anywhere leaves nothing partially committed.
    pub fn write_row(&mut self, values: &[Value]) -> Result<()> {
        self.check_open()?;
        if values.len() != self.scheme.len() {
            return Err(Error::encode(format!(
                "expected {} values, got {}",
                self.scheme.len(),
                values.len()
            )));
        }

        let mut body = Vec::new();
        for (field, value) in self.scheme.fields().iter().zip(values) {
            field
                .tag
                .encode(value, &*self.dyn_codec, &mut body)
                .map_err(|e| match e {
                    Error::Encode(msg) => Error::encode(format!("field \"{}\": {msg}", field.name)),
                    other => other,
                })?;
        }

        self.pending.write_u64::<LittleEndian>(body.len() as u64)?;
        self.pending.extend_from_slice(&body);
        self.entry_count += 1;

        if self.pending.len() > FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    /// Write one record from named values. Scheme fields absent from the
    /// record take their tag's default (explicit null exists only for the
    /// dynamic type, as `Value::Dyn(null)`).
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        let mut row: Vec<Value> = self
            .scheme
            .fields()
            .iter()
            .map(|f| f.tag.default_value())
            .collect();
        for (name, value) in &record.fields {
            if let Some(pos) = self.scheme.position(name) {
                row[pos] = value.clone();
            }
        }
        self.write_row(&row)
    }

    fn flush(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            trace!("flushing {} pending bytes", self.pending.len());
            self.stream.write(&self.pending)?;
            self.pending.clear();
        }
        Ok(())
    }

    /// Flush pending frames and finalize the stream with the entry-count
    /// trailer. Idempotent; a closed writer rejects further writes.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.stream.close(Some(&self.entry_count.to_le_bytes()))?;
        self.closed = true;
        debug!("container closed with {} entries", self.entry_count);
        Ok(())
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

impl<S: ByteStream> std::fmt::Debug for ZrecReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZrecReader")
            .field("entry_count", &self.entry_count)
            .field("reset_pos", &self.reset_pos)
            .field("data_end", &self.data_end)
            .finish_non_exhaustive()
    }
}

pub struct ZrecReader<S: ByteStream> {
    stream:      S,
    scheme:      Scheme,
    dyn_codec:   Box<dyn DynCodec>,
    entry_count: u64,
    reset_pos:   u64,
    /// First logical byte of the trailer; records never cross it.
    data_end:    u64,
}

impl ZrecReader<ZstdStream> {
    /// Open a container at `path` over a block-compressed stream.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(ZstdStream::open(path)?)
    }
}

impl<S: ByteStream> ZrecReader<S> {
    pub fn new(stream: S) -> Result<Self> {
        Self::with_dyn_codec(stream, Box::new(JsonDynCodec))
    }

    /// Open a container: probe the trailing entry count, rewind, parse the
    /// scheme header, and record the post-header reset position.
    pub fn with_dyn_codec(mut stream: S, dyn_codec: Box<dyn DynCodec>) -> Result<Self> {
        let logical_len = stream.seek(SeekFrom::End(0))?;
        if logical_len < TRAILER_SIZE {
            return Err(Error::corrupt(format!(
                "stream holds {logical_len} bytes, too short for an entry-count trailer"
            )));
        }
        stream.seek(SeekFrom::End(-(TRAILER_SIZE as i64)))?;
        let mut trailer = [0u8; 8];
        if stream.read(&mut trailer)? < trailer.len() {
            return Err(Error::corrupt("truncated entry-count trailer"));
        }
        let entry_count = u64::from_le_bytes(trailer);

        stream.seek(SeekFrom::Start(0))?;
        let mut len_raw = [0u8; 8];
        if stream.read(&mut len_raw)? < len_raw.len() {
            return Err(Error::corrupt("truncated scheme header length"));
        }
        let data_end = logical_len - TRAILER_SIZE;
        let declared_header = u64::from_le_bytes(len_raw);
        if declared_header > data_end.saturating_sub(8) {
            return Err(Error::corrupt(format!(
                "scheme header declares {declared_header} bytes, crossing the trailer"
            )));
        }
        let header_len = usize::try_from(declared_header)
            .map_err(|_| Error::corrupt("scheme header length does not fit in memory"))?;
        let mut body = vec![0u8; header_len];
        if stream.read(&mut body)? < body.len() {
            return Err(Error::corrupt("truncated scheme header"));
        }
        let scheme = Scheme::from_body(&body)?;

        let reset_pos = stream.tell()?;
        if reset_pos > data_end {
            return Err(Error::corrupt("scheme header overlaps the trailer"));
        }

        debug!(
            "opened container: {} fields, {} entries",
            scheme.len(),
            entry_count
        );
        Ok(Self {
            stream,
            scheme,
            dyn_codec,
            entry_count,
            reset_pos,
            data_end,
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// Trailer-derived total record count, independent of how many records
    /// have been consumed so far.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Current cursor offset.
    pub fn tell(&mut self) -> Result<u64> {
        self.stream.tell()
    }

    /// Seek back to the first record.
    pub fn reset(&mut self) -> Result<()> {
        self.stream.seek(SeekFrom::Start(self.reset_pos))?;
        Ok(())
    }

    pub(crate) fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.stream.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Read up to `count` records from the cursor, positionally, each
    /// annotated with its frame's start offset. A short (possibly empty)
    /// batch signals exhaustion.
    pub fn read_rows(&mut self, count: usize) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        for _ in 0..count {
            let offset = self.stream.tell()?;
            if offset >= self.data_end {
                break;
            }

            let mut len_raw = [0u8; 8];
            let got = self.stream.read(&mut len_raw)?;
            if got == 0 {
                break;
            }
            if got < len_raw.len() {
                return Err(Error::corrupt(format!(
                    "truncated record length prefix at offset {offset}"
                )));
            }
            // offset < data_end already holds; compare against the bytes
            // left so a crafted length near u64::MAX cannot wrap the check.
            let remaining = self.data_end - offset;
            if remaining < 8 {
                return Err(Error::corrupt(format!(
                    "record length prefix at offset {offset} crosses the trailer"
                )));
            }
            let declared = u64::from_le_bytes(len_raw);
            if declared > remaining - 8 {
                return Err(Error::corrupt(format!(
                    "record at offset {offset} declares {declared} bytes, crossing the trailer"
                )));
            }
            let frame_len = usize::try_from(declared)
                .map_err(|_| Error::corrupt("record length does not fit in memory"))?;

            let mut body = vec![0u8; frame_len];
            if self.stream.read(&mut body)? < body.len() {
                return Err(Error::corrupt(format!(
                    "record at offset {offset} truncated mid-frame"
                )));
            }

            let mut cur = 0usize;
            let mut values = Vec::with_capacity(self.scheme.len());
            for field in self.scheme.fields() {
                let (value, next) = field.tag.decode(&body, cur, &*self.dyn_codec)?;
                values.push(value);
                cur = next;
            }
            if cur != body.len() {
                return Err(Error::corrupt(format!(
                    "record at offset {offset} has {} undecoded trailing bytes",
                    body.len() - cur
                )));
            }
            out.push(Entry { offset, values });
        }
        Ok(out)
    }

    /// Read up to `count` records from the cursor, keyed by field name.
    pub fn read_named(&mut self, count: usize) -> Result<Vec<NamedEntry>> {
        let rows = self.read_rows(count)?;
        Ok(rows.into_iter().map(|e| self.to_named(e)).collect())
    }

    /// Seek to `pos` (an offset previously produced by this reader) and
    /// read positionally from there.
    pub fn read_rows_at(&mut self, pos: u64, count: usize) -> Result<Vec<Entry>> {
        self.seek_to(pos)?;
        self.read_rows(count)
    }

    /// Seek to `pos` and read name-keyed from there.
    pub fn read_named_at(&mut self, pos: u64, count: usize) -> Result<Vec<NamedEntry>> {
        self.seek_to(pos)?;
        self.read_named(count)
    }

    /// Lazy positional iterator over the remaining records. Restart with
    /// [`ZrecReader::reset`].
    pub fn rows(&mut self) -> Rows<'_, S> {
        Rows {
            reader: self,
            batch: Vec::new().into_iter(),
            done: false,
        }
    }

    /// Lazy name-keyed iterator over the remaining records.
    pub fn named_entries(&mut self) -> NamedEntries<'_, S> {
        NamedEntries { inner: self.rows() }
    }

    fn to_named(&self, entry: Entry) -> NamedEntry {
        let fields = self
            .scheme
            .fields()
            .iter()
            .map(|f| f.name.clone())
            .zip(entry.values)
            .collect();
        NamedEntry {
            offset: entry.offset,
            fields,
        }
    }
}

// ── Iterators ────────────────────────────────────────────────────────────────

/// See [`ZrecReader::rows`]. Pulls batches of [`DEFAULT_BATCH`] internally.
pub struct Rows<'r, S: ByteStream> {
    reader: &'r mut ZrecReader<S>,
    /// Current batch, drained in order; refilled when empty.
    batch:  std::vec::IntoIter<Entry>,
    done:   bool,
}

impl<S: ByteStream> Iterator for Rows<'_, S> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(entry) = self.batch.next() {
            return Some(Ok(entry));
        }
        match self.reader.read_rows(DEFAULT_BATCH) {
            Ok(batch) if batch.is_empty() => {
                self.done = true;
                None
            }
            Ok(batch) => {
                self.batch = batch.into_iter();
                self.batch.next().map(Ok)
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// See [`ZrecReader::named_entries`].
pub struct NamedEntries<'r, S: ByteStream> {
    inner: Rows<'r, S>,
}

impl<S: ByteStream> Iterator for NamedEntries<'_, S> {
    type Item = Result<NamedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some(entry.map(|e| self.inner.reader.to_named(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn small_scheme() -> Scheme {
        Scheme::parse([("n", 'i'), ("s", 's')]).unwrap()
    }

    fn write_three(stream: &mut Cursor<Vec<u8>>) {
        let mut w = ZrecWriter::new(&mut *stream, small_scheme()).unwrap();
        for i in 0..3i64 {
            w.write_row(&[Value::Int(i), Value::Str(i.to_string())]).unwrap();
        }
        w.close().unwrap();
    }

    #[test]
    fn named_write_applies_defaults() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut w = ZrecWriter::new(&mut buf, small_scheme()).unwrap();
            w.write_record(&Record::new().set("s", "only-s")).unwrap();
            w.close().unwrap();
        }
        buf.set_position(0);
        let mut r = ZrecReader::new(buf).unwrap();
        let rows = r.read_rows(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, vec![Value::Int(0), Value::Str("only-s".into())]);
    }

    #[test]
    fn closed_writer_rejects_writes_and_recloses_quietly() {
        let mut buf = Cursor::new(Vec::new());
        let mut w = ZrecWriter::new(&mut buf, small_scheme()).unwrap();
        w.close().unwrap();
        w.close().unwrap(); // no-op
        let err = w.write_row(&[Value::Int(1), Value::Str("x".into())]).unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
    }

    #[test]
    fn arity_mismatch_commits_nothing() {
        let mut buf = Cursor::new(Vec::new());
        let mut w = ZrecWriter::new(&mut buf, small_scheme()).unwrap();
        assert!(w.write_row(&[Value::Int(1)]).is_err());
        assert_eq!(w.entry_count(), 0);
        w.close().unwrap();
        buf.set_position(0);
        let mut r = ZrecReader::new(buf).unwrap();
        assert_eq!(r.entry_count(), 0);
        assert!(r.read_rows(5).unwrap().is_empty());
    }

    #[test]
    fn iterator_restarts_after_reset() {
        let mut buf = Cursor::new(Vec::new());
        write_three(&mut buf);
        buf.set_position(0);
        let mut r = ZrecReader::new(buf).unwrap();

        let first: Vec<Entry> = r.rows().map(|e| e.unwrap()).collect();
        assert_eq!(first.len(), 3);
        assert!(r.rows().next().is_none());

        r.reset().unwrap();
        let second: Vec<Entry> = r.rows().map(|e| e.unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn huge_record_length_prefix_is_corruption_not_panic() {
        let mut buf = Cursor::new(Vec::new());
        write_three(&mut buf);
        // First record frame sits right after the scheme header.
        let header_len = u64::from_le_bytes(buf.get_ref()[..8].try_into().unwrap());
        let first = 8 + header_len as usize;
        buf.get_mut()[first..first + 8].copy_from_slice(&(u64::MAX - 3).to_le_bytes());
        buf.set_position(0);
        let mut r = ZrecReader::new(buf).unwrap();
        assert!(matches!(r.read_rows(1).unwrap_err(), Error::Corrupt(_)));
    }

    #[test]
    fn huge_scheme_header_length_is_corruption() {
        let mut buf = Cursor::new(Vec::new());
        write_three(&mut buf);
        buf.get_mut()[..8].copy_from_slice(&(u64::MAX / 2).to_le_bytes());
        buf.set_position(0);
        assert!(matches!(
            ZrecReader::new(buf).unwrap_err(),
            Error::Corrupt(_)
        ));
    }

    #[test]
    fn trailer_is_never_parsed_as_a_record() {
        let mut buf = Cursor::new(Vec::new());
        write_three(&mut buf);
        buf.set_position(0);
        let mut r = ZrecReader::new(buf).unwrap();
        // Ask for far more than exist: exhaustion, not an error.
        let rows = r.read_rows(1000).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(r.read_rows(1).unwrap().is_empty());
    }
}
