//! `zrec` — a schema-driven binary record container.
//!
//! Callers declare a fixed ordered set of named, typed fields (a scheme),
//! append records conforming to it, and read them back sequentially or at
//! arbitrary byte offsets. A companion index engine maps field values to
//! record offsets for value-based lookup without a full scan.
//!
//! ```no_run
//! use zrec::{Scheme, Record, Value, ZrecWriter, ZrecReader};
//! use zrec::index::{build_index, KeySelector, IndexOptions};
//!
//! let scheme = Scheme::parse([("n", 'i'), ("s", 's')])?;
//! let mut writer = ZrecWriter::create("data.zrec", scheme)?;
//! for i in 0..3i64 {
//!     writer.write_record(&Record::new().set("n", i).set("s", i.to_string()))?;
//! }
//! writer.close()?;
//!
//! let mut reader = ZrecReader::open("data.zrec")?;
//! assert_eq!(reader.entry_count(), 3);
//! let by_n = build_index(&mut reader, &KeySelector::field("n"), IndexOptions::default())?;
//! let hits = reader.read_rows_at(by_n["1"][0], 1)?;
//! assert_eq!(hits[0].values[0], Value::Int(1));
//! # Ok::<(), zrec::Error>(())
//! ```

pub mod codec;
pub mod container;
pub mod error;
pub mod index;
pub mod scheme;
pub mod stream;
pub mod value;

pub use codec::{DynCodec, JsonDynCodec, TypeTag};
pub use container::{Entry, NamedEntry, Record, ZrecReader, ZrecWriter};
pub use error::{Error, Result};
pub use scheme::{Field, Scheme};
pub use stream::block::ZstdStream;
pub use stream::{ByteStream, FileStream};
pub use value::Value;
