//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while validating or encoding protocol types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The mutation kind is not one of the recognized kinds.
    #[error("unrecognized mutation kind: {0:?}")]
    UnknownKind(String),

    /// The entity type is not one of the recognized types.
    #[error("unrecognized entity type: {0:?}")]
    UnknownEntityType(String),

    /// A mutation request failed validation.
    #[error("invalid mutation request: {0}")]
    InvalidRequest(String),

    /// CBOR encoding failed.
    #[error("encoding failed: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decoding failed: {0}")]
    Decode(String),
}
