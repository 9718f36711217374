//! Transport error classification.
//!
//! The pipelines treat the transport as an opaque byte stream; the only
//! transport-specific logic in the crate is mapping `std::io` failures
//! onto the channel fault vocabulary so callers see the same error for
//! the same condition regardless of the underlying stream type.

use std::io;

use crate::error::RpcError;

/// Map a transport I/O failure to its channel fault.
pub fn translate_io_error(e: &io::Error) -> RpcError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => RpcError::ConnectionRefused,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => RpcError::ConnectionAborted,
        io::ErrorKind::TimedOut => RpcError::ConnectionTimeout,
        io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => RpcError::HostUnreachable,
        kind => RpcError::Io {
            kind,
            message: e.to_string(),
        },
    }
}
