//! Typed message envelopes and body encoding.
//!
//! Every message body on the wire starts with a 1-byte kind
//! discriminator:
//!
//! - [`BODY_KIND_ENVELOPE`]: the rest is the pluggable serializer's
//!   encoding of a [`Message`].
//! - [`BODY_KIND_BINARY_PAGE`]: a raw stream page that bypasses the
//!   serializer - length-prefixed call-id followed by the page payload.
//!
//! System and stream auxiliary messages are ordinary envelopes
//! distinguished by their deserialized variant, not by a wire tag.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::wire_format::Endianness;
use crate::codec::Serializer;
use crate::error::{Result, RpcError};

/// Body kind: serializer-encoded message envelope.
pub const BODY_KIND_ENVELOPE: u8 = 0;

/// Body kind: raw binary stream page (serializer bypass).
pub const BODY_KIND_BINARY_PAGE: u8 = 1;

/// Outcome of a login attempt, carried in the login response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginResult {
    Ok,
    InvalidCredentials,
}

/// Control-plane messages exchanged by the session coordinators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SystemMessage {
    /// Client-initiated handshake carrying credentials.
    Login { username: String, secret: String },
    /// Server verdict on a login attempt.
    LoginResponse {
        result: LoginResult,
        error: Option<String>,
    },
    /// Client announces graceful close.
    Logout,
    /// Idle keep-alive; carries nothing, expects nothing.
    Heartbeat,
    /// Request cancellation for an already-transmitted call.
    CancelRequest { call_id: String },
}

/// Stream auxiliary messages (flow control and lifecycle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamMessage {
    /// A batch of opaque, pre-encoded items.
    Page { call_id: String, items: Vec<Bytes> },
    /// Acknowledges `consumed` pages; opens the writer's window back up.
    PageAck { call_id: String, consumed: u32 },
    /// Writer finished; optionally asks the reader to confirm drain.
    Close { call_id: String, ack_requested: bool },
    /// Reader confirms it drained everything after a close.
    CloseAck { call_id: String },
    /// Reader-initiated cancellation.
    Cancel { call_id: String, drop_pending: bool },
    /// Raw byte page; only ever travels via the binary fast path.
    BinaryPage { call_id: String, payload: Bytes },
}

impl StreamMessage {
    /// Call-id of the stream this message belongs to.
    pub fn call_id(&self) -> &str {
        match self {
            StreamMessage::Page { call_id, .. }
            | StreamMessage::PageAck { call_id, .. }
            | StreamMessage::Close { call_id, .. }
            | StreamMessage::CloseAck { call_id }
            | StreamMessage::Cancel { call_id, .. }
            | StreamMessage::BinaryPage { call_id, .. } => call_id,
        }
    }
}

/// Tagged union of everything that can travel over a channel.
///
/// Every request/response/stream message carries a non-empty call-id
/// unique among concurrently outstanding operations on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Fire-and-forget user message; no response expected.
    OneWay { body: Bytes },
    /// User request awaiting a correlated response.
    Request {
        call_id: String,
        cancellable: bool,
        body: Bytes,
    },
    /// Successful response to a request.
    Response { call_id: String, body: Bytes },
    /// Failure response to a request.
    Fault {
        call_id: String,
        code: String,
        text: String,
        detail: Option<Bytes>,
    },
    /// Session control-plane message.
    System(SystemMessage),
    /// Stream auxiliary message.
    Stream(StreamMessage),
}

impl Message {
    /// Call-id, when this message kind carries one.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Message::Request { call_id, .. }
            | Message::Response { call_id, .. }
            | Message::Fault { call_id, .. } => Some(call_id),
            Message::Stream(aux) => Some(aux.call_id()),
            Message::System(SystemMessage::CancelRequest { call_id }) => Some(call_id),
            _ => None,
        }
    }

    #[inline]
    pub fn is_system(&self) -> bool {
        matches!(self, Message::System(_))
    }

    /// Short label for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::OneWay { .. } => "one-way",
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
            Message::Fault { .. } => "fault",
            Message::System(_) => "system",
            Message::Stream(StreamMessage::BinaryPage { .. }) => "binary-page",
            Message::Stream(_) => "stream",
        }
    }
}

/// Build a fault message from an error, tagged with the failing call-id.
///
/// A handler-supplied request fault travels verbatim; anything else is
/// rendered from the error's fault code and display text.
pub fn fault_from_error(call_id: String, error: &RpcError) -> Message {
    match error {
        RpcError::RequestFault { code, text, detail } => Message::Fault {
            call_id,
            code: code.clone(),
            text: text.clone(),
            detail: detail.clone().map(Bytes::from),
        },
        other => Message::Fault {
            call_id,
            code: other.fault_code().to_string(),
            text: other.to_string(),
            detail: None,
        },
    }
}

/// Encode a message body: kind byte plus envelope or binary-page layout.
pub fn encode_body(
    message: &Message,
    serializer: &dyn Serializer,
    endianness: Endianness,
) -> Result<Bytes> {
    if let Message::Stream(StreamMessage::BinaryPage { call_id, payload }) = message {
        let id = call_id.as_bytes();
        if id.is_empty() || id.len() > usize::from(u16::MAX) {
            return Err(RpcError::ProtocolViolation(format!(
                "binary page call-id length {} does not fit its prefix",
                id.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(3 + id.len() + payload.len());
        buf.put_u8(BODY_KIND_BINARY_PAGE);
        let mut len = [0u8; 2];
        endianness.put_u16(&mut len, id.len() as u16);
        buf.put_slice(&len);
        buf.put_slice(id);
        buf.put_slice(payload);
        return Ok(buf.freeze());
    }

    let envelope = serializer.serialize(message)?;
    let mut buf = BytesMut::with_capacity(1 + envelope.len());
    buf.put_u8(BODY_KIND_ENVELOPE);
    buf.put_slice(&envelope);
    Ok(buf.freeze())
}

/// Decode a message body produced by [`encode_body`].
pub fn decode_body(
    body: Bytes,
    serializer: &dyn Serializer,
    endianness: Endianness,
) -> Result<Message> {
    let Some(&kind) = body.first() else {
        return Err(RpcError::ProtocolViolation("empty message body".to_string()));
    };

    match kind {
        BODY_KIND_ENVELOPE => serializer.deserialize(&body[1..]),
        BODY_KIND_BINARY_PAGE => {
            if body.len() < 3 {
                return Err(RpcError::ProtocolViolation(
                    "binary page shorter than its call-id prefix".to_string(),
                ));
            }
            let id_len = endianness.get_u16(&body[1..3]) as usize;
            let payload_start = 3 + id_len;
            if id_len == 0 || body.len() < payload_start {
                return Err(RpcError::ProtocolViolation(format!(
                    "binary page call-id length {id_len} exceeds body"
                )));
            }
            let call_id = std::str::from_utf8(&body[3..payload_start])
                .map_err(|_| {
                    RpcError::ProtocolViolation("binary page call-id is not UTF-8".to_string())
                })?
                .to_string();
            Ok(Message::Stream(StreamMessage::BinaryPage {
                call_id,
                payload: body.slice(payload_start..),
            }))
        }
        other => Err(RpcError::ProtocolViolation(format!(
            "unknown body kind {other}"
        ))),
    }
}
