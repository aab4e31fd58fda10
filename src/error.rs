//! Typed error hierarchy for grit-bt
//!
//! One sum type covers every failure surface of the client. Expected negative
//! outcomes (a piece hash that does not match, a PIECE that matches no pending
//! request) are booleans at their call sites, not errors.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the client
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket or disk I/O failure
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Storage-level failure with an offending path
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Peer wire protocol violation
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Tracker reported a failure or returned garbage
    #[error("Tracker error: {0}")]
    Tracker(String),

    /// Invalid input from the user (descriptor path, arguments)
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Session is shutting down
    #[error("Session is shutting down")]
    Shutdown,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Target file already exists (overwrite is not supported)
    AlreadyExists,
    /// A byte range did not map onto the files table
    UnmappedRange,
    /// Other I/O error
    Io,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Handshake bytes did not match the protocol string
    InvalidHandshake,
    /// Handshake carried a different info-hash
    InfoHashMismatch,
    /// Frame length exceeded the fixed cap
    OversizeFrame,
    /// Message payload shorter than its id requires
    InvalidPayload,
    /// Malformed torrent descriptor
    InvalidDescriptor,
    /// Bencode syntax error
    BencodeParse,
    /// Peer misbehaved (repeated bad hashes, bogus blocks)
    PeerMisbehaved,
}

impl ClientError {
    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// True for a malformed message payload the connection can survive.
    ///
    /// The frame has already been consumed, so the stream stays in sync and
    /// the read loop may continue. Oversize frames and handshake violations
    /// are never survivable.
    pub fn is_malformed_payload(&self) -> bool {
        matches!(
            self,
            Self::Protocol {
                kind: ProtocolErrorKind::InvalidPayload,
                ..
            }
        )
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Tracker(err.to_string())
    }
}
