//! Type registry and wire codec.
//!
//! # Identity rules
//! Every field type is identified by a single ASCII tag byte, written once
//! per field into the container's scheme header. Tags are frozen: a tag is
//! never reused for a different layout, and readers MUST reject unknown
//! tags at header-parse time rather than guess a width.
//!
//! # Endianness
//! All multi-byte values on disk are little-endian. Strings and arrays are
//! length-prefixed with a `u64`; fixed-width scalars carry no prefix.
//!
//! # Dynamic payloads
//! The `a` tag stores a `u64` byte length followed by a self-describing
//! serialization of an arbitrary nested value. The payload format lives
//! behind [`DynCodec`] so it can be swapped without touching record
//! framing; the default [`JsonDynCodec`] uses serde_json. A zero-length
//! payload is the explicit null marker.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::value::Value;

// ── Frozen tag bytes ─────────────────────────────────────────────────────────

pub const TAG_INT:          u8 = b'i';
pub const TAG_UINT:         u8 = b'u';
pub const TAG_FLOAT:        u8 = b'f';
pub const TAG_DOUBLE:       u8 = b'd';
pub const TAG_STR:          u8 = b's';
pub const TAG_INT_ARRAY:    u8 = b'I';
pub const TAG_UINT_ARRAY:   u8 = b'U';
pub const TAG_FLOAT_ARRAY:  u8 = b'F';
pub const TAG_DOUBLE_ARRAY: u8 = b'D';
pub const TAG_STR_ARRAY:    u8 = b'S';
pub const TAG_DYN:          u8 = b'a';

// ── TypeTag ──────────────────────────────────────────────────────────────────

/// One variant per supported field type. Each variant carries its default
/// value, encoder, and decoder; adding a type means adding a variant here,
/// not mutating a runtime table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Int,
    UInt,
    Float,
    Double,
    Str,
    IntArray,
    UIntArray,
    FloatArray,
    DoubleArray,
    StrArray,
    Dyn,
}

impl TypeTag {
    /// Resolve a tag byte. Returns `None` for tags not known to this build.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            TAG_INT          => Some(TypeTag::Int),
            TAG_UINT         => Some(TypeTag::UInt),
            TAG_FLOAT        => Some(TypeTag::Float),
            TAG_DOUBLE       => Some(TypeTag::Double),
            TAG_STR          => Some(TypeTag::Str),
            TAG_INT_ARRAY    => Some(TypeTag::IntArray),
            TAG_UINT_ARRAY   => Some(TypeTag::UIntArray),
            TAG_FLOAT_ARRAY  => Some(TypeTag::FloatArray),
            TAG_DOUBLE_ARRAY => Some(TypeTag::DoubleArray),
            TAG_STR_ARRAY    => Some(TypeTag::StrArray),
            TAG_DYN          => Some(TypeTag::Dyn),
            _                => None,
        }
    }

    /// The frozen on-disk tag byte.
    #[inline]
    pub fn byte(self) -> u8 {
        match self {
            TypeTag::Int         => TAG_INT,
            TypeTag::UInt        => TAG_UINT,
            TypeTag::Float       => TAG_FLOAT,
            TypeTag::Double      => TAG_DOUBLE,
            TypeTag::Str         => TAG_STR,
            TypeTag::IntArray    => TAG_INT_ARRAY,
            TypeTag::UIntArray   => TAG_UINT_ARRAY,
            TypeTag::FloatArray  => TAG_FLOAT_ARRAY,
            TypeTag::DoubleArray => TAG_DOUBLE_ARRAY,
            TypeTag::StrArray    => TAG_STR_ARRAY,
            TypeTag::Dyn         => TAG_DYN,
        }
    }

    /// Human-readable name (for diagnostics only — never parsed).
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Int         => "int",
            TypeTag::UInt        => "uint",
            TypeTag::Float       => "float",
            TypeTag::Double      => "double",
            TypeTag::Str         => "string",
            TypeTag::IntArray    => "int array",
            TypeTag::UIntArray   => "uint array",
            TypeTag::FloatArray  => "float array",
            TypeTag::DoubleArray => "double array",
            TypeTag::StrArray    => "string array",
            TypeTag::Dyn         => "dynamic",
        }
    }

    /// The value substituted when a named write omits this field.
    ///
    /// Floats default to NaN and the dynamic type to explicit null, while
    /// integers default to 0 and strings/arrays to empty. The asymmetry is
    /// inherited from the format's origin and is part of the contract.
    pub fn default_value(self) -> Value {
        match self {
            TypeTag::Int         => Value::Int(0),
            TypeTag::UInt        => Value::UInt(0),
            TypeTag::Float       => Value::Float(f32::NAN),
            TypeTag::Double      => Value::Double(f64::NAN),
            TypeTag::Str         => Value::Str(String::new()),
            TypeTag::IntArray    => Value::IntArray(Vec::new()),
            TypeTag::UIntArray   => Value::UIntArray(Vec::new()),
            TypeTag::FloatArray  => Value::FloatArray(Vec::new()),
            TypeTag::DoubleArray => Value::DoubleArray(Vec::new()),
            TypeTag::StrArray    => Value::StrArray(Vec::new()),
            TypeTag::Dyn         => Value::Dyn(serde_json::Value::Null),
        }
    }

    // ── Encoding ─────────────────────────────────────────────────────────────

    /// Append the wire form of `value` to `out`.
    ///
    /// The value's shape must match the tag exactly; a mismatch is an
    /// [`Error::Encode`]. Callers that need record atomicity encode into a
    /// scratch buffer and commit it only on success (the writer does).
    pub fn encode(self, value: &Value, dyn_codec: &dyn DynCodec, out: &mut Vec<u8>) -> Result<()> {
        match (self, value) {
            (TypeTag::Int, Value::Int(v))       => out.write_i64::<LittleEndian>(*v)?,
            (TypeTag::UInt, Value::UInt(v))     => out.write_u64::<LittleEndian>(*v)?,
            (TypeTag::Float, Value::Float(v))   => out.write_f32::<LittleEndian>(*v)?,
            (TypeTag::Double, Value::Double(v)) => out.write_f64::<LittleEndian>(*v)?,
            (TypeTag::Str, Value::Str(v))       => encode_str(v, out)?,
            (TypeTag::IntArray, Value::IntArray(vs)) => {
                out.write_u64::<LittleEndian>(vs.len() as u64)?;
                for v in vs {
                    out.write_i64::<LittleEndian>(*v)?;
                }
            }
            (TypeTag::UIntArray, Value::UIntArray(vs)) => {
                out.write_u64::<LittleEndian>(vs.len() as u64)?;
                for v in vs {
                    out.write_u64::<LittleEndian>(*v)?;
                }
            }
            (TypeTag::FloatArray, Value::FloatArray(vs)) => {
                out.write_u64::<LittleEndian>(vs.len() as u64)?;
                for v in vs {
                    out.write_f32::<LittleEndian>(*v)?;
                }
            }
            (TypeTag::DoubleArray, Value::DoubleArray(vs)) => {
                out.write_u64::<LittleEndian>(vs.len() as u64)?;
                for v in vs {
                    out.write_f64::<LittleEndian>(*v)?;
                }
            }
            (TypeTag::StrArray, Value::StrArray(vs)) => {
                out.write_u64::<LittleEndian>(vs.len() as u64)?;
                for v in vs {
                    encode_str(v, out)?;
                }
            }
            (TypeTag::Dyn, Value::Dyn(v)) => {
                if v.is_null() {
                    // Zero length is the null marker.
                    out.write_u64::<LittleEndian>(0)?;
                } else {
                    let payload = dyn_codec.encode(v)?;
                    out.write_u64::<LittleEndian>(payload.len() as u64)?;
                    out.extend_from_slice(&payload);
                }
            }
            (tag, other) => {
                return Err(Error::encode(format!(
                    "expected {} value, got {}",
                    tag.name(),
                    other.kind()
                )));
            }
        }
        Ok(())
    }

    // ── Decoding ─────────────────────────────────────────────────────────────

    /// Decode one value of this type from `data` at `offset`, returning the
    /// value and the offset just past it. Never reads beyond a declared
    /// length; a prefix exceeding the remaining bytes is [`Error::Corrupt`].
    pub fn decode(
        self,
        data: &[u8],
        offset: usize,
        dyn_codec: &dyn DynCodec,
    ) -> Result<(Value, usize)> {
        match self {
            TypeTag::Int => {
                let (raw, next) = take(data, offset, 8)?;
                Ok((Value::Int(LittleEndian::read_i64(raw)), next))
            }
            TypeTag::UInt => {
                let (raw, next) = take(data, offset, 8)?;
                Ok((Value::UInt(LittleEndian::read_u64(raw)), next))
            }
            TypeTag::Float => {
                let (raw, next) = take(data, offset, 4)?;
                Ok((Value::Float(LittleEndian::read_f32(raw)), next))
            }
            TypeTag::Double => {
                let (raw, next) = take(data, offset, 8)?;
                Ok((Value::Double(LittleEndian::read_f64(raw)), next))
            }
            TypeTag::Str => {
                let (s, next) = decode_str(data, offset)?;
                Ok((Value::Str(s), next))
            }
            TypeTag::IntArray => {
                let (count, cur) = take_count(data, offset)?;
                let (raw, next) = take(data, cur, checked_size(count, 8)?)?;
                let mut vs = Vec::with_capacity(count);
                for i in 0..count {
                    vs.push(LittleEndian::read_i64(&raw[i * 8..i * 8 + 8]));
                }
                Ok((Value::IntArray(vs), next))
            }
            TypeTag::UIntArray => {
                let (count, cur) = take_count(data, offset)?;
                let (raw, next) = take(data, cur, checked_size(count, 8)?)?;
                let mut vs = Vec::with_capacity(count);
                for i in 0..count {
                    vs.push(LittleEndian::read_u64(&raw[i * 8..i * 8 + 8]));
                }
                Ok((Value::UIntArray(vs), next))
            }
            TypeTag::FloatArray => {
                let (count, cur) = take_count(data, offset)?;
                let (raw, next) = take(data, cur, checked_size(count, 4)?)?;
                let mut vs = Vec::with_capacity(count);
                for i in 0..count {
                    vs.push(LittleEndian::read_f32(&raw[i * 4..i * 4 + 4]));
                }
                Ok((Value::FloatArray(vs), next))
            }
            TypeTag::DoubleArray => {
                let (count, cur) = take_count(data, offset)?;
                let (raw, next) = take(data, cur, checked_size(count, 8)?)?;
                let mut vs = Vec::with_capacity(count);
                for i in 0..count {
                    vs.push(LittleEndian::read_f64(&raw[i * 8..i * 8 + 8]));
                }
                Ok((Value::DoubleArray(vs), next))
            }
            TypeTag::StrArray => {
                let (count, mut cur) = take_count(data, offset)?;
                let mut vs = Vec::new();
                for _ in 0..count {
                    let (s, next) = decode_str(data, cur)?;
                    vs.push(s);
                    cur = next;
                }
                Ok((Value::StrArray(vs), cur))
            }
            TypeTag::Dyn => {
                let (len, cur) = take_count(data, offset)?;
                if len == 0 {
                    return Ok((Value::Dyn(serde_json::Value::Null), cur));
                }
                let (raw, next) = take(data, cur, len)?;
                Ok((Value::Dyn(dyn_codec.decode(raw)?), next))
            }
        }
    }
}

// ── Wire helpers ─────────────────────────────────────────────────────────────

/// `u64 byteLen` + UTF-8 bytes.
pub(crate) fn encode_str(s: &str, out: &mut Vec<u8>) -> Result<()> {
    out.write_u64::<LittleEndian>(s.len() as u64)?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn decode_str(data: &[u8], offset: usize) -> Result<(String, usize)> {
    let (len, cur) = take_count(data, offset)?;
    let (raw, next) = take(data, cur, len)?;
    let s = std::str::from_utf8(raw)
        .map_err(|e| Error::corrupt(format!("invalid UTF-8 in string field: {e}")))?;
    Ok((s.to_string(), next))
}

/// Borrow exactly `len` bytes at `offset`, or fail as corruption.
pub(crate) fn take(data: &[u8], offset: usize, len: usize) -> Result<(&[u8], usize)> {
    let end = offset
        .checked_add(len)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| {
            Error::corrupt(format!(
                "declared length {len} at offset {offset} exceeds remaining {} bytes",
                data.len().saturating_sub(offset)
            ))
        })?;
    Ok((&data[offset..end], end))
}

/// Read a `u64` length/count prefix and narrow it to `usize`.
pub(crate) fn take_count(data: &[u8], offset: usize) -> Result<(usize, usize)> {
    let (raw, next) = take(data, offset, 8)?;
    let n = LittleEndian::read_u64(raw);
    let n = usize::try_from(n)
        .map_err(|_| Error::corrupt(format!("length prefix {n} does not fit in memory")))?;
    Ok((n, next))
}

fn checked_size(count: usize, width: usize) -> Result<usize> {
    count
        .checked_mul(width)
        .ok_or_else(|| Error::corrupt("array length overflows addressable size"))
}

// ── Dynamic payload codec ────────────────────────────────────────────────────

/// Serialization strategy for the `a` (dynamic) type's payload.
///
/// Implementations must round-trip nested maps with string keys, arrays,
/// integers, floats, strings, booleans, and null exactly. Null is handled
/// by the framing layer (zero-length payload) and never reaches a codec.
pub trait DynCodec {
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// Default dynamic codec: the payload is the serde_json byte serialization
/// of the value.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDynCodec;

impl DynCodec for JsonDynCodec {
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| Error::encode(format!("dynamic payload serialization failed: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::corrupt(format!("malformed dynamic payload: {e}")))
    }
}
