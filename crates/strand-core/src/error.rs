use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StrandError {
    /// Invalid caller input or malformed primitive value.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Decode/parsing failure.
    #[error("decode error: {0}")]
    Decode(&'static str),
}

#[cfg(test)]
mod tests {
    use super::StrandError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            StrandError::InvalidInput("bad position").to_string(),
            "invalid input: bad position"
        );
        assert_eq!(
            StrandError::Decode("bad packet kind").to_string(),
            "decode error: bad packet kind"
        );
    }
}
