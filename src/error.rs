//! Error types for wireline channels.
//!
//! A single fault can fan out to every pending call on a channel, so
//! [`RpcError`] is `Clone`; I/O errors are flattened to their kind plus
//! message instead of carrying the non-cloneable `std::io::Error`.

use thiserror::Error;

/// Main error type for all channel operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// Untranslated I/O error from the transport.
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    /// Remote endpoint refused the connection.
    #[error("connection refused")]
    ConnectionRefused,

    /// Connection aborted or reset by the peer.
    #[error("connection aborted by peer")]
    ConnectionAborted,

    /// No bytes arrived within the configured receive timeout.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// Transport was shut down locally.
    #[error("transport shut down")]
    ConnectionShutdown,

    /// Remote host could not be reached or resolved.
    #[error("host unreachable")]
    HostUnreachable,

    /// Handshake message was malformed or arrived out of sequence.
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    /// Peer violated the protocol (unknown call-id, unexpected message).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Chunk header failed validation (reserved flag bits set).
    #[error("invalid chunk header: {0}")]
    InvalidHeader(String),

    /// Message could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Remote request handler returned a fault.
    #[error("request fault [{code}]: {text}")]
    RequestFault {
        code: String,
        text: String,
        detail: Option<Vec<u8>>,
    },

    /// Remote request handler panicked or failed unexpectedly.
    #[error("request handler crashed: {0}")]
    RequestCrash(String),

    /// Remote endpoint had no handler capacity left for the request.
    #[error("handler capacity exhausted")]
    Overloaded,

    /// Login handshake did not complete within the login timeout.
    #[error("login timed out")]
    LoginTimeout,

    /// Authenticator rejected the supplied credentials.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Channel is closed (or was closed while the operation was pending).
    #[error("channel closed")]
    ChannelClosed,

    /// Operation was canceled before completion.
    #[error("operation canceled")]
    OperationCanceled,

    /// Stream has already completed; no further items can be written.
    #[error("stream completed")]
    StreamCompleted,

    /// Transmit buffer stayed full past the send timeout.
    #[error("send timed out")]
    SendTimeout,

    /// Message body exceeds the configured maximum.
    #[error("message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },
}

impl RpcError {
    /// Whether this fault represents an orderly close rather than a failure.
    ///
    /// Channels that tear down with a graceful fault end in `Closed`;
    /// everything else ends in `Faulted`.
    pub fn is_graceful(&self) -> bool {
        matches!(self, RpcError::ChannelClosed | RpcError::ConnectionShutdown)
    }

    /// Fault code transmitted on the wire for request faults.
    pub fn fault_code(&self) -> &'static str {
        match self {
            RpcError::RequestCrash(_) => "request_crash",
            RpcError::Overloaded => "overloaded",
            RpcError::Serialization(_) => "serialization",
            RpcError::OperationCanceled => "canceled",
            _ => "fault",
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RpcError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RpcError::Serialization(e.to_string())
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
