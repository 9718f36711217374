//! Protocol module - wire framing, message envelopes, and parsing.
//!
//! This module implements the binary message plane:
//! - 3-byte chunk header encoding/decoding with explicit endianness
//! - typed message envelopes and the body kind discriminator
//! - incremental parser reassembling chunked messages

mod message;
mod parser;
mod wire_format;

pub use message::{
    decode_body, encode_body, fault_from_error, LoginResult, Message, StreamMessage, SystemMessage,
    BODY_KIND_BINARY_PAGE, BODY_KIND_ENVELOPE,
};
pub use parser::MessageParser;
pub use wire_format::{
    flags, ChunkHeader, Endianness, CHUNK_HEADER_SIZE, DEFAULT_MAX_MESSAGE_SIZE, MAX_CHUNK_PAYLOAD,
};
