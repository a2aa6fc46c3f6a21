//! Fixed 22-byte packet header with zero-copy, little-endian field access.
//!
//! Unlike a cache-line-sized frame header, this layout packs irregular
//! widths (u16/u64/u32/u8) at hand-specified offsets, so fields are read and
//! written with explicit `to_le_bytes`/`from_le_bytes` slicing rather than a
//! `#[repr(C, packed)]` cast.

use crate::error::{ProtocolError, Result};

/// Bit set on [`PacketHeader::flags`] when the payload is LZ4-compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Bit set on [`PacketHeader::flags`] when the payload is AEAD-sealed.
pub const FLAG_ENCRYPTED: u8 = 0b0000_0010;

/// Payload discriminator carried in the `Type` header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    /// Opaque binary payload.
    Binary,
    /// UTF-8 string payload.
    String,
    /// Value not recognized by this implementation; preserved verbatim.
    Unknown(u8),
}

impl PayloadType {
    /// Decode a raw `Type` byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Binary,
            1 => Self::String,
            other => Self::Unknown(other),
        }
    }

    /// Encode back to the raw `Type` byte.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Binary => 0,
            Self::String => 1,
            Self::Unknown(v) => v,
        }
    }
}

/// Fixed 22-byte packet header (little-endian).
///
/// Wire layout: `length(2) id(2) timestamp(8) checksum(4) code(2) number(1)
/// type(1) flags(1) priority(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    length: u16,
    id: u16,
    timestamp: u64,
    checksum: u32,
    code: u16,
    number: u8,
    kind: u8,
    flags: u8,
    priority: u8,
}

impl PacketHeader {
    /// Serialized header size in bytes.
    pub const SIZE: usize = 22;

    /// Construct a header for a given opcode and payload length.
    ///
    /// `length` is set to `SIZE + payload_len`; `checksum` must be filled in
    /// separately via [`Self::set_checksum`] once the payload is known.
    #[must_use]
    pub fn new(id: u16, payload_len: usize, timestamp_ms: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let length = (Self::SIZE + payload_len) as u16;
        Self {
            length,
            id,
            timestamp: timestamp_ms,
            checksum: 0,
            code: 0,
            number: 0,
            kind: PayloadType::Binary.to_u8(),
            flags: 0,
            priority: 0,
        }
    }

    /// Parse a header from the first [`Self::SIZE`] bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// - `Truncated` if fewer than `SIZE` bytes are available.
    /// - `Malformed` if `length` is less than `SIZE`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() });
        }

        let length = u16::from_le_bytes([bytes[0], bytes[1]]);
        if (length as usize) < Self::SIZE {
            return Err(ProtocolError::Malformed(format!(
                "length {length} is less than HEADER_SIZE {}",
                Self::SIZE
            )));
        }

        let id = u16::from_le_bytes([bytes[2], bytes[3]]);
        let timestamp = u64::from_le_bytes(
            bytes[4..12]
                .try_into()
                .map_err(|_| ProtocolError::Malformed("timestamp field out of bounds".into()))?,
        );
        let checksum = u32::from_le_bytes(
            bytes[12..16]
                .try_into()
                .map_err(|_| ProtocolError::Malformed("checksum field out of bounds".into()))?,
        );
        let code = u16::from_le_bytes([bytes[16], bytes[17]]);
        let number = bytes[18];
        let kind = bytes[19];
        let flags = bytes[20];
        let priority = bytes[21];

        Ok(Self { length, id, timestamp, checksum, code, number, kind, flags, priority })
    }

    /// Serialize the header to its fixed 22-byte wire form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.length.to_le_bytes());
        out[2..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..12].copy_from_slice(&self.timestamp.to_le_bytes());
        out[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        out[16..18].copy_from_slice(&self.code.to_le_bytes());
        out[18] = self.number;
        out[19] = self.kind;
        out[20] = self.flags;
        out[21] = self.priority;
        out
    }

    /// Total frame length (header + payload), as declared by this header.
    #[must_use]
    pub fn length(&self) -> u16 {
        self.length
    }

    /// Opcode routing key.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Milliseconds since epoch at send time.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// CRC-32 of the payload bytes.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Application-level status code.
    #[must_use]
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Sequence/counter within a stream.
    #[must_use]
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Payload discriminator.
    #[must_use]
    pub fn payload_type(&self) -> PayloadType {
        PayloadType::from_u8(self.kind)
    }

    /// Raw flags byte.
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Whether [`FLAG_COMPRESSED`] is set.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Whether [`FLAG_ENCRYPTED`] is set.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Policy hint.
    #[must_use]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Overwrite the checksum field (after the payload is known).
    pub fn set_checksum(&mut self, checksum: u32) {
        self.checksum = checksum;
    }

    /// Overwrite the application status code.
    pub fn set_code(&mut self, code: u16) {
        self.code = code;
    }

    /// Overwrite the stream sequence number.
    pub fn set_number(&mut self, number: u8) {
        self.number = number;
    }

    /// Overwrite the payload discriminator.
    pub fn set_payload_type(&mut self, kind: PayloadType) {
        self.kind = kind.to_u8();
    }

    /// Overwrite the raw flags byte.
    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    /// Overwrite the policy priority hint.
    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    /// Recompute `length` from a new payload size.
    pub fn set_payload_len(&mut self, payload_len: usize) {
        #[allow(clippy::cast_possible_truncation)]
        let length = (Self::SIZE + payload_len) as u16;
        self.length = length;
    }
}
