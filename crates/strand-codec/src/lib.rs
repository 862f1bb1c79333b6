//! Wire form of strand event records.
//!
//! Defines the [`record::EventRecord`] replication unit, its typed payload
//! variants, and the CBOR codec used by log stores.

pub mod error;
pub mod record;

pub use error::CodecError;
pub use record::{decode_record_cbor, encode_record_cbor, EventKind, EventPayload, EventRecord};
