use thiserror::Error;

/// Errors returned by record codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR deserialization failure.
    #[error("decode error: {0}")]
    Decode(String),
    /// Record-level schema validation failure.
    #[error("invalid record: {0}")]
    InvalidRecord(&'static str),
}
