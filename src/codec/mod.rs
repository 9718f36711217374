//! Codec module - pluggable message serialization.
//!
//! The channel core never fixes the wire encoding of message envelopes;
//! it only consumes the [`Serializer`] contract. [`MsgPackSerializer`]
//! is the default implementation.

mod msgpack;

pub use msgpack::MsgPackSerializer;

use crate::error::Result;
use crate::protocol::Message;

/// Serialization contract consumed by the transmit/receive pipelines.
///
/// Implementations must be deterministic and side-effect free; they run
/// on pipeline tasks and any error they return faults the channel on the
/// receive path.
pub trait Serializer: Send + Sync + 'static {
    /// Encode a message envelope to bytes.
    fn serialize(&self, message: &Message) -> Result<Vec<u8>>;

    /// Decode a message envelope from bytes.
    fn deserialize(&self, bytes: &[u8]) -> Result<Message>;
}
