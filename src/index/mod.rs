//! Index engine: derived value → record-offset mappings.
//!
//! An index is rebuildable at any time from its source container and is
//! built entirely on the reader's public read/seek contract. Keys come from
//! a named field or a caller-supplied extractor; a multi-valued selection
//! (an array field, or an extractor returning several keys) contributes the
//! record's offset once per distinct key. Null and empty-string keys are
//! dropped.
//!
//! Builds scan position-annotated batches from the start of the container
//! and restore the reader's cursor on every exit path, including errors —
//! a failed build never leaves the cursor pointing into a record.
//!
//! # Persisted layout
//! A persisted index is a flat sequence (no scheme header):
//! `{u64 (8 + keyByteLen), u64 position, keyBytes}` per entry, closed with
//! a `u64` total-entry-count trailer. The leading length covers the
//! position *and* the key; decoders subtract 8 before reading the key.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::debug;

use crate::container::{NamedEntry, ZrecReader, DEFAULT_BATCH};
use crate::error::{Error, Result};
use crate::stream::block::ZstdStream;
use crate::stream::ByteStream;

/// In-memory index: stringified key → record start offsets in scan order.
pub type ValueIndex = BTreeMap<String, Vec<u64>>;

// ── Options ──────────────────────────────────────────────────────────────────

/// Tuning for one index build. `filter` rejects records before they count
/// toward `limit`; `progress` is invoked once per scanned batch with the
/// batch's record count and has no effect on correctness.
#[derive(Default)]
pub struct IndexOptions<'a> {
    pub filter:   Option<Box<dyn Fn(&NamedEntry) -> bool + 'a>>,
    pub limit:    Option<u64>,
    pub progress: Option<Box<dyn FnMut(u64) + 'a>>,
}

// ── Key selection ────────────────────────────────────────────────────────────

/// How a record yields its index key(s).
pub enum KeySelector<'a> {
    /// The stringified value(s) of one named field.
    Field(String),
    /// A caller-supplied extractor over the full record. An error aborts
    /// the whole build.
    Extract(Box<dyn Fn(&NamedEntry) -> Result<Vec<String>> + 'a>),
}

impl<'a> KeySelector<'a> {
    pub fn field(name: impl Into<String>) -> Self {
        KeySelector::Field(name.into())
    }

    pub fn extract(f: impl Fn(&NamedEntry) -> Result<Vec<String>> + 'a) -> Self {
        KeySelector::Extract(Box::new(f))
    }

    fn keys_for(&self, entry: &NamedEntry) -> Result<Vec<String>> {
        match self {
            KeySelector::Field(name) => {
                let value = entry.get(name).ok_or_else(|| {
                    Error::KeyExtract(format!("field \"{name}\" is not in the scheme"))
                })?;
                Ok(value.index_keys())
            }
            KeySelector::Extract(f) => {
                let keys = f(entry)?;
                Ok(keys.into_iter().filter(|k| !k.is_empty()).collect())
            }
        }
    }
}

// ── Cursor guard ─────────────────────────────────────────────────────────────

/// Restores the reader's cursor when dropped, so an aborted scan cannot
/// leave it mid-record.
struct CursorGuard<'r, S: ByteStream> {
    reader: &'r mut ZrecReader<S>,
    saved:  u64,
}

impl<'r, S: ByteStream> CursorGuard<'r, S> {
    fn new(reader: &'r mut ZrecReader<S>) -> Result<Self> {
        let saved = reader.tell()?;
        Ok(Self { reader, saved })
    }
}

impl<S: ByteStream> Drop for CursorGuard<'_, S> {
    fn drop(&mut self) {
        let _ = self.reader.seek_to(self.saved);
    }
}

// ── Build ────────────────────────────────────────────────────────────────────

/// Scan every record, feeding each surviving (key, offset) pair to `sink`.
fn scan<S, F>(
    reader: &mut ZrecReader<S>,
    selector: &KeySelector,
    mut opts: IndexOptions,
    mut sink: F,
) -> Result<()>
where
    S: ByteStream,
    F: FnMut(&str, u64) -> Result<()>,
{
    let mut guard = CursorGuard::new(reader)?;
    guard.reader.reset()?;

    let mut accepted = 0u64;
    'scan: loop {
        let batch = guard.reader.read_named(DEFAULT_BATCH)?;
        if batch.is_empty() {
            break;
        }
        let scanned = batch.len() as u64;
        for entry in &batch {
            if opts.limit.is_some_and(|limit| accepted >= limit) {
                break 'scan;
            }
            if opts.filter.as_ref().is_some_and(|filter| !filter(entry)) {
                continue;
            }
            accepted += 1;
            // One contribution per distinct key, in first-occurrence order,
            // even when the selection repeats a key.
            let keys = selector.keys_for(entry)?;
            let mut distinct: Vec<String> = Vec::with_capacity(keys.len());
            for key in keys {
                if !distinct.contains(&key) {
                    distinct.push(key);
                }
            }
            for key in &distinct {
                sink(key, entry.offset)?;
            }
        }
        if let Some(progress) = opts.progress.as_mut() {
            progress(scanned);
        }
    }
    Ok(())
}

/// Build an in-memory index over `reader`'s records.
///
/// Keys map to the full, scan-ordered list of byte offsets of the records
/// that produced them; a record contributes once per distinct key it
/// yields. The reader's cursor is restored before returning.
pub fn build_index<S: ByteStream>(
    reader: &mut ZrecReader<S>,
    selector: &KeySelector,
    opts: IndexOptions,
) -> Result<ValueIndex> {
    let mut index = ValueIndex::new();
    scan(reader, selector, opts, |key, offset| {
        index.entry(key.to_string()).or_default().push(offset);
        Ok(())
    })?;
    debug!("built in-memory index with {} keys", index.len());
    Ok(index)
}

/// Build an index and persist it to `dest` instead of returning it.
///
/// `dest` is closed with the total index-entry count as its trailer. Zero
/// surviving entries still produce a valid trailer-terminated file. On
/// error the destination is abandoned unfinalized (no trailer), which
/// [`load_index`] rejects as incomplete.
pub fn build_index_to<S: ByteStream, D: ByteStream>(
    reader: &mut ZrecReader<S>,
    mut dest: D,
    selector: &KeySelector,
    opts: IndexOptions,
) -> Result<()> {
    let mut total = 0u64;
    scan(reader, selector, opts, |key, offset| {
        let mut frame = Vec::with_capacity(16 + key.len());
        frame.write_u64::<LittleEndian>(8 + key.len() as u64)?;
        frame.write_u64::<LittleEndian>(offset)?;
        frame.extend_from_slice(key.as_bytes());
        dest.write(&frame)?;
        total += 1;
        Ok(())
    })?;
    dest.close(Some(&total.to_le_bytes()))?;
    debug!("persisted index with {total} entries");
    Ok(())
}

/// [`build_index_to`] over a new block-compressed file at `path`.
pub fn build_index_to_path<S: ByteStream>(
    reader: &mut ZrecReader<S>,
    path: impl AsRef<Path>,
    selector: &KeySelector,
    opts: IndexOptions,
) -> Result<()> {
    build_index_to(reader, ZstdStream::create(path)?, selector, opts)
}

// ── Load ─────────────────────────────────────────────────────────────────────

/// Rebuild the value → offsets mapping from a persisted index, appending
/// each offset to its key's list in file order. The entry count read back
/// must match the trailer, otherwise the file is rejected as incomplete.
pub fn load_index<D: ByteStream>(mut stream: D) -> Result<ValueIndex> {
    let logical_len = stream.seek(SeekFrom::End(0))?;
    if logical_len < 8 {
        return Err(Error::corrupt("index file too short for a trailer"));
    }
    stream.seek(SeekFrom::End(-8))?;
    let mut trailer = [0u8; 8];
    if stream.read(&mut trailer)? < trailer.len() {
        return Err(Error::corrupt("truncated index trailer"));
    }
    let declared = u64::from_le_bytes(trailer);
    let data_end = logical_len - 8;

    stream.seek(SeekFrom::Start(0))?;
    let mut index = ValueIndex::new();
    let mut total = 0u64;
    let mut pos = 0u64;
    while pos < data_end {
        let mut len_raw = [0u8; 8];
        if stream.read(&mut len_raw)? < len_raw.len() {
            return Err(Error::corrupt(format!(
                "truncated index entry length at offset {pos}"
            )));
        }
        // pos < data_end already holds; compare against the bytes left so a
        // crafted length near u64::MAX cannot wrap the check.
        let remaining = data_end - pos;
        if remaining < 8 {
            return Err(Error::corrupt(format!(
                "index entry length at offset {pos} crosses the trailer"
            )));
        }
        let frame_len = u64::from_le_bytes(len_raw);
        if frame_len < 8 || frame_len > remaining - 8 {
            return Err(Error::corrupt(format!(
                "index entry at offset {pos} declares {frame_len} bytes, crossing the trailer"
            )));
        }

        let mut body = vec![0u8; frame_len as usize];
        if stream.read(&mut body)? < body.len() {
            return Err(Error::corrupt(format!(
                "index entry at offset {pos} truncated mid-frame"
            )));
        }
        let position = LittleEndian::read_u64(&body[..8]);
        // Length covers the position too, so the key starts 8 bytes in.
        let key = std::str::from_utf8(&body[8..])
            .map_err(|e| Error::corrupt(format!("invalid UTF-8 index key: {e}")))?;

        index.entry(key.to_string()).or_default().push(position);
        total += 1;
        pos += 8 + frame_len;
    }

    if total != declared {
        return Err(Error::corrupt(format!(
            "index trailer declares {declared} entries but file holds {total}"
        )));
    }
    Ok(index)
}

/// [`load_index`] over a block-compressed file at `path`.
pub fn load_index_path(path: impl AsRef<Path>) -> Result<ValueIndex> {
    load_index(ZstdStream::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ZrecWriter;
    use crate::scheme::Scheme;
    use crate::value::Value;
    use std::io::Cursor;

    fn sample_reader() -> ZrecReader<Cursor<Vec<u8>>> {
        let scheme = Scheme::parse([("n", 'i'), ("tags", 'S')]).unwrap();
        let mut buf = Cursor::new(Vec::new());
        {
            let mut w = ZrecWriter::new(&mut buf, scheme).unwrap();
            w.write_row(&[Value::Int(1), Value::StrArray(vec!["a".into(), "b".into()])])
                .unwrap();
            w.write_row(&[Value::Int(2), Value::StrArray(vec!["b".into()])])
                .unwrap();
            w.write_row(&[Value::Int(1), Value::StrArray(vec![])]).unwrap();
            w.close().unwrap();
        }
        buf.set_position(0);
        ZrecReader::new(buf).unwrap()
    }

    #[test]
    fn field_index_groups_offsets_in_scan_order() {
        let mut reader = sample_reader();
        let index =
            build_index(&mut reader, &KeySelector::field("n"), IndexOptions::default()).unwrap();
        assert_eq!(index.keys().collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(index["1"].len(), 2);
        assert!(index["1"][0] < index["2"][0]);
        assert!(index["2"][0] < index["1"][1]);
    }

    #[test]
    fn array_field_contributes_one_offset_per_element() {
        let mut reader = sample_reader();
        let index =
            build_index(&mut reader, &KeySelector::field("tags"), IndexOptions::default())
                .unwrap();
        assert_eq!(index["a"].len(), 1);
        assert_eq!(index["b"].len(), 2);
        // Record three had no tags and appears nowhere.
        assert_eq!(index.values().map(Vec::len).sum::<usize>(), 3);
    }

    #[test]
    fn repeated_keys_in_one_record_contribute_once() {
        let scheme = Scheme::parse([("tags", 'S')]).unwrap();
        let mut buf = Cursor::new(Vec::new());
        {
            let mut w = ZrecWriter::new(&mut buf, scheme).unwrap();
            w.write_row(&[Value::StrArray(vec!["b".into(), "b".into(), "a".into()])])
                .unwrap();
            w.close().unwrap();
        }
        buf.set_position(0);
        let mut reader = ZrecReader::new(buf).unwrap();

        let index =
            build_index(&mut reader, &KeySelector::field("tags"), IndexOptions::default())
                .unwrap();
        assert_eq!(index["b"].len(), 1);
        assert_eq!(index["a"], index["b"]);

        // The persisted path applies the same rule.
        let mut dest = Cursor::new(Vec::new());
        build_index_to(
            &mut reader,
            &mut dest,
            &KeySelector::field("tags"),
            IndexOptions::default(),
        )
        .unwrap();
        dest.set_position(0);
        assert_eq!(load_index(dest).unwrap(), index);
    }

    #[test]
    fn oversized_index_entry_length_is_corruption() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(u64::MAX - 7).to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(b"k");
        bytes.extend_from_slice(&1u64.to_le_bytes()); // trailer
        let err = load_index(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn rejecting_filter_yields_empty_index() {
        let mut reader = sample_reader();
        let opts = IndexOptions {
            filter: Some(Box::new(|_| false)),
            ..Default::default()
        };
        let index = build_index(&mut reader, &KeySelector::field("n"), opts).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn limit_counts_accepted_records_only() {
        let mut reader = sample_reader();
        let opts = IndexOptions {
            filter: Some(Box::new(|e| e.get("n") != Some(&Value::Int(1)))),
            limit: Some(1),
            ..Default::default()
        };
        let index = build_index(&mut reader, &KeySelector::field("n"), opts).unwrap();
        // The first accepted record is n=2; the limit stops there.
        assert_eq!(index.len(), 1);
        assert_eq!(index["2"].len(), 1);
    }

    #[test]
    fn failed_extractor_aborts_and_restores_cursor() {
        let mut reader = sample_reader();
        let before = reader.tell().unwrap();
        let selector = KeySelector::extract(|_| Err(Error::KeyExtract("boom".into())));
        let err = build_index(&mut reader, &selector, IndexOptions::default()).unwrap_err();
        assert!(matches!(err, Error::KeyExtract(_)));
        assert_eq!(reader.tell().unwrap(), before);
        // The reader still works from where it was.
        assert_eq!(reader.read_rows(10).unwrap().len(), 3);
    }

    #[test]
    fn persisted_roundtrip_matches_in_memory() {
        let mut reader = sample_reader();
        let expected =
            build_index(&mut reader, &KeySelector::field("n"), IndexOptions::default()).unwrap();

        let mut dest = Cursor::new(Vec::new());
        build_index_to(
            &mut reader,
            &mut dest,
            &KeySelector::field("n"),
            IndexOptions::default(),
        )
        .unwrap();
        dest.set_position(0);
        assert_eq!(load_index(dest).unwrap(), expected);
    }

    #[test]
    fn empty_persisted_index_is_trailer_only() {
        let mut reader = sample_reader();
        let mut dest = Cursor::new(Vec::new());
        let opts = IndexOptions {
            filter: Some(Box::new(|_| false)),
            ..Default::default()
        };
        build_index_to(&mut reader, &mut dest, &KeySelector::field("n"), opts).unwrap();
        assert_eq!(dest.get_ref().as_slice(), &0u64.to_le_bytes()[..]);
        dest.set_position(0);
        assert!(load_index(dest).unwrap().is_empty());
    }
}
