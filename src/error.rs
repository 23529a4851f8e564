//! Crate-wide error type.
//!
//! One enum covers the whole failure surface: schema validation, per-record
//! encode checks, decode-time corruption, stream I/O, and index-build key
//! extraction. Running out of records is never an error — readers signal
//! exhaustion with a short (possibly empty) batch.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid scheme: duplicate field name or unknown type tag.
    /// Raised at writer/reader open before any record is touched.
    #[error("Schema error: {0}")]
    Schema(String),

    /// A value's shape does not match its field's declared type tag.
    /// The offending record is not committed to the pending buffer.
    #[error("Encode error: {0}")]
    Encode(String),

    /// The stored bytes contradict themselves: a length prefix exceeding
    /// the remaining data, a block checksum mismatch, or a malformed
    /// dynamic payload. Never silently truncated.
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Operation on a writer or stream that has already been closed.
    #[error("Stream closed: {0}")]
    Closed(&'static str),

    /// A caller-supplied key extractor failed; the whole index build aborts.
    #[error("Index key extraction failed: {0}")]
    KeyExtract(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub(crate) fn encode(msg: impl Into<String>) -> Self {
        Error::Encode(msg.into())
    }

    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        Error::Schema(msg.into())
    }
}
