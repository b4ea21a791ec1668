//! Error types for protocol decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while decoding or validating protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line or payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A line was valid JSON but did not match any known shape.
    #[error("malformed sync line: {0}")]
    MalformedLine(String),

    /// Unknown oplog operation kind.
    #[error("unknown oplog operation: {0}")]
    UnknownOpType(String),

    /// Unknown CRUD update type.
    #[error("unknown update type: {0}")]
    UnknownUpdateType(String),

    /// An op id could not be parsed as a 64-bit integer.
    #[error("invalid op id: {0}")]
    InvalidOpId(String),

    /// A checkpoint diff arrived without a base checkpoint.
    #[error("checkpoint diff received without a checkpoint")]
    DiffWithoutCheckpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::UnknownOpType("UPSERT".into());
        assert_eq!(err.to_string(), "unknown oplog operation: UPSERT");

        let err = ProtocolError::InvalidOpId("abc".into());
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn json_error_converts() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::Json(_)));
    }
}
