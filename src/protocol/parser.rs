//! Incremental message parser.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for reassembling chunked messages:
//! - `ChunkHeader`: need 3 header bytes
//! - `ChunkBody`: header parsed, need N more payload bytes
//!
//! Chunks repeat until one carries the end-of-message flag; only then is
//! the complete body yielded. A single-chunk message is handed out
//! without copying; bodies that span chunks are coalesced once at the
//! end.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{ChunkHeader, Endianness, CHUNK_HEADER_SIZE, DEFAULT_MAX_MESSAGE_SIZE};
use crate::error::{Result, RpcError};

/// State machine for chunk parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete 3-byte chunk header.
    WaitingForHeader,
    /// Header parsed, waiting for the chunk payload bytes.
    WaitingForBody {
        remaining: usize,
        end_of_message: bool,
    },
}

/// Accumulates incoming bytes and extracts complete message bodies.
///
/// Input may be fed in arbitrary fragments, down to one byte at a time;
/// partial data is buffered internally until the next push.
pub struct MessageParser {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Completed chunks of the in-progress message.
    fragments: Vec<Bytes>,
    /// Total bytes accumulated for the in-progress message.
    assembled: usize,
    /// Maximum allowed message body size.
    max_message_size: usize,
    /// Wire byte order.
    endianness: Endianness,
}

impl MessageParser {
    /// Create a parser with default limits and big-endian framing.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_MESSAGE_SIZE, Endianness::Big)
    }

    /// Create a parser with a custom message size cap and byte order.
    pub fn with_limits(max_message_size: usize, endianness: Endianness) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            fragments: Vec::new(),
            assembled: 0,
            max_message_size,
            endianness,
        }
    }

    /// Push data into the parser and extract all complete message bodies.
    ///
    /// Returns the bodies completed by this push (may be empty).
    ///
    /// # Errors
    ///
    /// Fails on reserved header bits or when an assembling message
    /// exceeds the configured maximum; framing errors are unrecoverable
    /// and the parser must not be fed again after one.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut bodies = Vec::new();
        while let Some(body) = self.try_extract_one()? {
            bodies.push(body);
        }
        Ok(bodies)
    }

    /// Try to extract a single complete message body.
    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    let Some(header) = ChunkHeader::decode(&self.buffer, self.endianness)? else {
                        return Ok(None);
                    };

                    let total = self.assembled + header.length as usize;
                    if total > self.max_message_size {
                        return Err(RpcError::MessageTooLarge {
                            size: total,
                            max: self.max_message_size,
                        });
                    }

                    let _ = self.buffer.split_to(CHUNK_HEADER_SIZE);
                    self.state = State::WaitingForBody {
                        remaining: header.length as usize,
                        end_of_message: header.end_of_message,
                    };
                }

                State::WaitingForBody {
                    remaining,
                    end_of_message,
                } => {
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    // Chunk fully buffered; take it without copying.
                    let fragment = self.buffer.split_to(remaining).freeze();
                    self.assembled += fragment.len();
                    self.state = State::WaitingForHeader;

                    if !end_of_message {
                        self.fragments.push(fragment);
                        continue;
                    }

                    self.assembled = 0;
                    if self.fragments.is_empty() {
                        return Ok(Some(fragment));
                    }

                    // Multi-chunk message: coalesce fragments once.
                    let total: usize =
                        self.fragments.iter().map(Bytes::len).sum::<usize>() + fragment.len();
                    let mut body = BytesMut::with_capacity(total);
                    for piece in self.fragments.drain(..) {
                        body.put_slice(&piece);
                    }
                    body.put_slice(&fragment);
                    return Ok(Some(body.freeze()));
                }
            }
        }
    }

    /// Number of buffered bytes not yet part of a complete message.
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.assembled
    }

    /// Whether the parser sits at a message boundary with nothing pending.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.fragments.is_empty() && self.assembled == 0
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}
