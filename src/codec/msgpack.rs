//! MsgPack serializer using `rmp-serde`.
//!
//! Uses `to_vec_named` so message envelopes travel as maps with field
//! names rather than positional arrays; that keeps the wire layout stable
//! across field reordering and readable for non-Rust peers.

use super::Serializer;
use crate::error::Result;
use crate::protocol::Message;

/// MessagePack serializer for message envelopes.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackSerializer;

impl MsgPackSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for MsgPackSerializer {
    #[inline]
    fn serialize(&self, message: &Message) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(message)?)
    }

    #[inline]
    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
