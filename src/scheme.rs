//! Scheme header: the ordered field-name/type-tag list that prefaces every
//! container file.
//!
//! On disk the header is `u64 byteLen` followed by, per field in order, a
//! length-prefixed UTF-8 name and one raw tag byte. Field order is fixed
//! for the lifetime of a file and determines both on-disk field order and
//! positional output order.

use std::collections::HashMap;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::codec::{self, TypeTag};
use crate::error::{Error, Result};

/// One scheme entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub tag:  TypeTag,
}

/// Ordered, immutable record shape. Names are unique; positions are stable.
#[derive(Debug, Clone)]
pub struct Scheme {
    fields:  Vec<Field>,
    by_name: HashMap<String, usize>,
}

impl Scheme {
    /// Build a scheme from `(name, tag)` pairs.
    /// Fails with a schema error on a duplicate field name.
    pub fn new<N: Into<String>>(pairs: impl IntoIterator<Item = (N, TypeTag)>) -> Result<Self> {
        let mut fields = Vec::new();
        let mut by_name = HashMap::new();
        for (name, tag) in pairs {
            let name = name.into();
            if by_name.insert(name.clone(), fields.len()).is_some() {
                return Err(Error::schema(format!("duplicate field name \"{name}\"")));
            }
            fields.push(Field { name, tag });
        }
        Ok(Self { fields, by_name })
    }

    /// Build a scheme from `(name, tagChar)` pairs, e.g. `("count", 'u')`.
    /// Fails with a schema error on an unknown tag character.
    pub fn parse<N: Into<String>>(pairs: impl IntoIterator<Item = (N, char)>) -> Result<Self> {
        let mut resolved = Vec::new();
        for (name, ch) in pairs {
            let tag = u8::try_from(ch)
                .ok()
                .and_then(TypeTag::from_byte)
                .ok_or_else(|| Error::schema(format!("unknown type tag '{ch}'")))?;
            resolved.push((name, tag));
        }
        Self::new(resolved)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Position of a field by name, if present.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    // ── Header serialization ──────────────────────────────────────────────────

    /// Full header bytes: `u64 byteLen` + per-field `string(name), tagByte`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for field in &self.fields {
            codec::encode_str(&field.name, &mut body)?;
            body.push(field.tag.byte());
        }
        let mut out = Vec::with_capacity(8 + body.len());
        out.write_u64::<LittleEndian>(body.len() as u64)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse a header body (the bytes after the `u64 byteLen` prefix).
    /// Fails on an unknown tag byte or a repeated field name.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut cur = 0usize;
        let mut pairs = Vec::new();
        while cur < body.len() {
            let (name, next) = codec::decode_str(body, cur)?;
            let (tag_raw, next) = codec::take(body, next, 1)?;
            let tag = TypeTag::from_byte(tag_raw[0]).ok_or_else(|| {
                Error::schema(format!(
                    "unknown type tag byte 0x{:02x} for field \"{name}\"",
                    tag_raw[0]
                ))
            })?;
            pairs.push((name, tag));
            cur = next;
        }
        Self::new(pairs)
    }
}

impl PartialEq for Scheme {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_preserves_order() {
        let scheme = Scheme::parse([("n", 'i'), ("tags", 'S'), ("meta", 'a')]).unwrap();
        let bytes = scheme.to_bytes().unwrap();
        assert_eq!(&bytes[..8], &(bytes.len() as u64 - 8).to_le_bytes()[..]);
        let back = Scheme::from_body(&bytes[8..]).unwrap();
        assert_eq!(back, scheme);
        assert_eq!(back.position("tags"), Some(1));
    }

    #[test]
    fn duplicate_name_rejected() {
        let err = Scheme::parse([("x", 'i'), ("x", 's')]).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn unknown_tag_rejected_on_parse() {
        assert!(matches!(
            Scheme::parse([("x", 'q')]).unwrap_err(),
            Error::Schema(_)
        ));
        // And when decoding a header written by a newer build.
        let scheme = Scheme::parse([("x", 'i')]).unwrap();
        let mut bytes = scheme.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] = b'z';
        assert!(matches!(
            Scheme::from_body(&bytes[8..]).unwrap_err(),
            Error::Schema(_)
        ));
    }

    #[test]
    fn empty_scheme_roundtrips() {
        let scheme = Scheme::new(Vec::<(String, TypeTag)>::new()).unwrap();
        let bytes = scheme.to_bytes().unwrap();
        assert_eq!(bytes, 0u64.to_le_bytes());
        assert!(Scheme::from_body(&bytes[8..]).unwrap().is_empty());
    }
}
