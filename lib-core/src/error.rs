//! Error model for the Boson DHT core.
//!
//! Every failure that can cross the wire is represented by one variant of
//! [`DhtError`], carrying the protocol error code from the message format.
//! Handlers map internal failures onto exactly one variant and reply with a
//! single error message; nothing in the core propagates panics for protocol
//! input.

use thiserror::Error;

/// Wire error codes understood by every Boson node.
pub mod code {
    pub const GENERIC: i32 = 1;
    pub const SERVER: i32 = 201;
    pub const PROTOCOL: i32 = 202;
    pub const METHOD_UNKNOWN: i32 = 203;
    pub const INVALID_TOKEN: i32 = 301;
    pub const INVALID_VALUE: i32 = 302;
    pub const INVALID_PEER: i32 = 303;
    pub const SEQUENCE_NOT_MONOTONIC: i32 = 304;
    pub const SEQUENCE_NOT_EXPECTED: i32 = 305;
    pub const IMMUTABLE_SUBSTITUTION_FAIL: i32 = 306;
}

/// Tagged error enum with one variant per wire error code.
///
/// The string payloads are operator-facing detail; the wire representation
/// is always `(code, message)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DhtError {
    /// Unclassified failure (code 1).
    #[error("{0}")]
    Generic(String),

    /// Internal failure while serving a request (code 201).
    #[error("server error: {0}")]
    Server(String),

    /// Malformed or unparseable input (code 202).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Request named a method this node does not implement (code 203).
    #[error("unknown method: {0}")]
    MethodUnknown(String),

    /// Write token missing, stale or forged (code 301).
    #[error("invalid token")]
    InvalidToken,

    /// Value failed structural or signature validation (code 302).
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Peer record failed structural or signature validation (code 303).
    #[error("invalid peer: {0}")]
    InvalidPeer(String),

    /// Mutable update carried a sequence number below the stored one (code 304).
    #[error("sequence number less than current")]
    SequenceNotMonotonic,

    /// Compare-and-swap expectation did not match the stored sequence (code 305).
    #[error("sequence number not expected")]
    SequenceNotExpected,

    /// Attempt to replace an immutable value with different bytes (code 306).
    #[error("immutable value cannot be replaced")]
    ImmutableSubstitutionFail,
}

impl DhtError {
    /// The numeric code carried on the wire for this error.
    pub fn code(&self) -> i32 {
        match self {
            DhtError::Generic(_) => code::GENERIC,
            DhtError::Server(_) => code::SERVER,
            DhtError::Protocol(_) => code::PROTOCOL,
            DhtError::MethodUnknown(_) => code::METHOD_UNKNOWN,
            DhtError::InvalidToken => code::INVALID_TOKEN,
            DhtError::InvalidValue(_) => code::INVALID_VALUE,
            DhtError::InvalidPeer(_) => code::INVALID_PEER,
            DhtError::SequenceNotMonotonic => code::SEQUENCE_NOT_MONOTONIC,
            DhtError::SequenceNotExpected => code::SEQUENCE_NOT_EXPECTED,
            DhtError::ImmutableSubstitutionFail => code::IMMUTABLE_SUBSTITUTION_FAIL,
        }
    }

    /// Rebuild an error from a wire `(code, message)` pair.
    ///
    /// Unknown codes collapse into [`DhtError::Generic`] so a newer peer
    /// cannot crash an older node.
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            code::SERVER => DhtError::Server(message),
            code::PROTOCOL => DhtError::Protocol(message),
            code::METHOD_UNKNOWN => DhtError::MethodUnknown(message),
            code::INVALID_TOKEN => DhtError::InvalidToken,
            code::INVALID_VALUE => DhtError::InvalidValue(message),
            code::INVALID_PEER => DhtError::InvalidPeer(message),
            code::SEQUENCE_NOT_MONOTONIC => DhtError::SequenceNotMonotonic,
            code::SEQUENCE_NOT_EXPECTED => DhtError::SequenceNotExpected,
            code::IMMUTABLE_SUBSTITUTION_FAIL => DhtError::ImmutableSubstitutionFail,
            _ => DhtError::Generic(message),
        }
    }
}

/// Convenience alias used across the core crates.
pub type Result<T> = std::result::Result<T, DhtError>;
