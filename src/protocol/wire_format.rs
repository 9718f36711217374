//! Chunk framing encode/decode.
//!
//! Every chunk on the wire starts with a 3-byte header:
//! ```text
//! ┌───────┬──────────────┐
//! │ Flags │ Chunk length │
//! │ 1 byte│ 2 bytes u16  │
//! └───────┴──────────────┘
//! ```
//!
//! Bit 0 of the flags byte marks the final chunk of a message; bits 1-7
//! are reserved and must be zero. The length field is packed in the
//! configured [`Endianness`], never assumed from the host.

use crate::error::{Result, RpcError};

/// Chunk header size in bytes (fixed, exactly 3).
pub const CHUNK_HEADER_SIZE: usize = 3;

/// Maximum payload bytes a single chunk can carry.
pub const MAX_CHUNK_PAYLOAD: usize = u16::MAX as usize;

/// Default maximum size of a whole (possibly multi-chunk) message body.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Flag constants for the chunk header.
pub mod flags {
    /// Final chunk of the current message (1) or continuation follows (0).
    pub const END_OF_MESSAGE: u8 = 0b0000_0001;

    /// Reserved bits mask (bits 1-7), must be zero on the wire.
    pub const RESERVED_MASK: u8 = 0b1111_1110;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Byte order used for multi-byte wire integers.
///
/// Explicit encode/decode over byte slices; both peers must configure the
/// same value. Defaults to big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

impl Endianness {
    /// Pack a u16 into the first two bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than 2 bytes.
    #[inline]
    pub fn put_u16(self, buf: &mut [u8], value: u16) {
        let bytes = match self {
            Endianness::Big => value.to_be_bytes(),
            Endianness::Little => value.to_le_bytes(),
        };
        buf[0..2].copy_from_slice(&bytes);
    }

    /// Unpack a u16 from the first two bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than 2 bytes.
    #[inline]
    pub fn get_u16(self, buf: &[u8]) -> u16 {
        let bytes = [buf[0], buf[1]];
        match self {
            Endianness::Big => u16::from_be_bytes(bytes),
            Endianness::Little => u16::from_le_bytes(bytes),
        }
    }
}

/// Decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Final chunk of the message.
    pub end_of_message: bool,
    /// Payload bytes following this header.
    pub length: u16,
}

impl ChunkHeader {
    /// Create a new chunk header.
    pub fn new(end_of_message: bool, length: u16) -> Self {
        Self {
            end_of_message,
            length,
        }
    }

    /// Encode the header to bytes in the given endianness.
    pub fn encode(&self, endianness: Endianness) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        self.encode_into(&mut buf, endianness);
        buf
    }

    /// Encode the header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is smaller than [`CHUNK_HEADER_SIZE`].
    pub fn encode_into(&self, buf: &mut [u8], endianness: Endianness) {
        debug_assert!(buf.len() >= CHUNK_HEADER_SIZE);
        buf[0] = if self.end_of_message {
            flags::END_OF_MESSAGE
        } else {
            0
        };
        endianness.put_u16(&mut buf[1..3], self.length);
    }

    /// Decode a header from bytes.
    ///
    /// Returns `Ok(None)` if the buffer holds fewer than
    /// [`CHUNK_HEADER_SIZE`] bytes. Reserved flag bits set on the wire are
    /// an unrecoverable framing error.
    pub fn decode(buf: &[u8], endianness: Endianness) -> Result<Option<Self>> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Ok(None);
        }
        let raw_flags = buf[0];
        if raw_flags & flags::RESERVED_MASK != 0 {
            return Err(RpcError::InvalidHeader(format!(
                "reserved flag bits set: {raw_flags:#04x}"
            )));
        }
        Ok(Some(Self {
            end_of_message: flags::has_flag(raw_flags, flags::END_OF_MESSAGE),
            length: endianness.get_u16(&buf[1..3]),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        for endianness in [Endianness::Big, Endianness::Little] {
            let original = ChunkHeader::new(true, 0x1234);
            let encoded = original.encode(endianness);
            let decoded = ChunkHeader::decode(&encoded, endianness).unwrap().unwrap();
            assert_eq!(original, decoded);
        }
    }

    #[test]
    fn test_big_endian_byte_order() {
        let header = ChunkHeader::new(false, 0x0102);
        let bytes = header.encode(Endianness::Big);

        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[1], 0x01);
        assert_eq!(bytes[2], 0x02);
    }

    #[test]
    fn test_little_endian_byte_order() {
        let header = ChunkHeader::new(true, 0x0102);
        let bytes = header.encode(Endianness::Little);

        assert_eq!(bytes[0], flags::END_OF_MESSAGE);
        assert_eq!(bytes[1], 0x02);
        assert_eq!(bytes[2], 0x01);
    }

    #[test]
    fn test_header_size_is_exactly_3() {
        assert_eq!(CHUNK_HEADER_SIZE, 3);
        let header = ChunkHeader::new(true, 0);
        assert_eq!(header.encode(Endianness::Big).len(), 3);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 2];
        assert_eq!(ChunkHeader::decode(&buf, Endianness::Big).unwrap(), None);
    }

    #[test]
    fn test_decode_reserved_bits_rejected() {
        let buf = [0b1000_0001, 0, 5];
        let result = ChunkHeader::decode(&buf, Endianness::Big);
        assert!(matches!(result, Err(RpcError::InvalidHeader(_))));
    }

    #[test]
    fn test_end_of_message_flag() {
        let final_chunk = ChunkHeader::new(true, 10).encode(Endianness::Big);
        let continuation = ChunkHeader::new(false, 10).encode(Endianness::Big);

        assert_eq!(final_chunk[0], 0x01);
        assert_eq!(continuation[0], 0x00);
    }

    #[test]
    fn test_max_length_value() {
        let header = ChunkHeader::new(true, u16::MAX);
        let encoded = header.encode(Endianness::Big);
        let decoded = ChunkHeader::decode(&encoded, Endianness::Big).unwrap().unwrap();
        assert_eq!(decoded.length as usize, MAX_CHUNK_PAYLOAD);
    }

    #[test]
    fn test_encode_into() {
        let header = ChunkHeader::new(true, 42);
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        header.encode_into(&mut buf, Endianness::Big);

        let decoded = ChunkHeader::decode(&buf, Endianness::Big).unwrap().unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_endianness_pack_unpack() {
        let mut buf = [0u8; 2];
        Endianness::Big.put_u16(&mut buf, 0xABCD);
        assert_eq!(buf, [0xAB, 0xCD]);
        assert_eq!(Endianness::Big.get_u16(&buf), 0xABCD);

        Endianness::Little.put_u16(&mut buf, 0xABCD);
        assert_eq!(buf, [0xCD, 0xAB]);
        assert_eq!(Endianness::Little.get_u16(&buf), 0xABCD);
    }
}
