//! Packet type combining the fixed header and a variable-length payload.

use bytes::{BufMut, Bytes};

use crate::{
    error::{ProtocolError, Result},
    header::PacketHeader,
    pool::{BufferPool, PooledBuffer, STACK_THRESHOLD},
};

/// A decoded wire packet: fixed header plus owned payload bytes.
///
/// # Invariants
///
/// `header.checksum()` is always CRC-32 of `payload` and `header.length()`
/// always equals `PacketHeader::SIZE + payload.len()` for packets built via
/// [`Packet::new`]. [`Packet::decode`] does not re-derive the checksum, so a
/// decoded packet may carry a checksum that disagrees with its payload —
/// that's exactly what [`Packet::is_valid`] checks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Fixed 22-byte header.
    pub header: PacketHeader,
    /// Payload bytes (already decompressed/decrypted if applicable).
    pub payload: Bytes,
}

impl Packet {
    /// Build a packet, computing `length` and `checksum` from `payload`.
    ///
    /// # Errors
    ///
    /// `PayloadTooLarge` if `payload.len()` does not fit in a `u16` once the
    /// header is added.
    pub fn new(id: u16, payload: impl Into<Bytes>, timestamp_ms: u64) -> Result<Self> {
        let payload = payload.into();

        if payload.len() > usize::from(u16::MAX) - PacketHeader::SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: usize::from(u16::MAX) - PacketHeader::SIZE,
            });
        }

        let mut header = PacketHeader::new(id, payload.len(), timestamp_ms);
        header.set_checksum(crc32fast::hash(&payload));

        Ok(Self { header, payload })
    }

    /// Encode into a caller-supplied buffer. Returns the number of bytes
    /// written.
    ///
    /// # Errors
    ///
    /// `PayloadTooLarge` if the payload no longer fits in `u16` (only
    /// possible if the header was hand-edited after construction).
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<usize> {
        if self.payload.len() > usize::from(u16::MAX) - PacketHeader::SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: usize::from(u16::MAX) - PacketHeader::SIZE,
            });
        }

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);
        Ok(PacketHeader::SIZE + self.payload.len())
    }

    /// Encode using a stack buffer for small frames, falling back to the
    /// buffer pool above [`STACK_THRESHOLD`] bytes.
    ///
    /// # Errors
    ///
    /// Same as [`Packet::encode`].
    pub fn encode_pooled(&self, pool: &dyn BufferPool) -> Result<Bytes> {
        let total = PacketHeader::SIZE + self.payload.len();

        if total <= STACK_THRESHOLD {
            let mut stack = [0u8; STACK_THRESHOLD];
            let mut cursor = &mut stack[..total];
            self.encode(&mut cursor)?;
            Ok(Bytes::copy_from_slice(&stack[..total]))
        } else {
            let mut rented = PooledBuffer::rent(pool, total, false);
            let mut cursor = &mut rented.as_mut_slice()[..total];
            self.encode(&mut cursor)?;
            Ok(Bytes::copy_from_slice(&rented.as_slice()[..total]))
        }
    }

    /// Decode a packet from `bytes`. Materializes the payload into an owned
    /// buffer (does not alias the input).
    ///
    /// # Errors
    ///
    /// - `Truncated` if `bytes.len() < HEADER_SIZE` or fewer bytes are
    ///   present than `length` declares.
    /// - `Malformed` if the header's internal invariants do not hold.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = PacketHeader::from_bytes(bytes)?;
        let total = header.length() as usize;

        if bytes.len() < total {
            return Err(ProtocolError::Truncated { expected: total, actual: bytes.len() });
        }

        let payload = Bytes::copy_from_slice(&bytes[PacketHeader::SIZE..total]);

        Ok(Self { header, payload })
    }

    /// Best-effort decode: `None` on any parse failure instead of an error.
    #[must_use]
    pub fn try_decode(bytes: &[u8]) -> Option<Self> {
        Self::decode(bytes).ok()
    }

    /// `true` when the header's checksum matches CRC-32 of the payload.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.header.checksum() == crc32fast::hash(&self.payload)
    }

    /// `true` when `now_ms - header.timestamp() > timeout_ms`.
    ///
    /// Clock skew where `now_ms < header.timestamp()` never reports expiry.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms >= self.header.timestamp() && now_ms - self.header.timestamp() > timeout_ms
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::pool::SharedBufferPool;

    impl Arbitrary for Packet {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            (any::<u16>(), prop::collection::vec(any::<u8>(), 0..4096), any::<u64>())
                .prop_map(|(id, payload, timestamp)| {
                    #[allow(clippy::expect_used)]
                    Self::new(id, payload, timestamp).expect("small payload always fits")
                })
                .boxed()
        }
    }

    proptest! {
        #[test]
        fn decode_of_encode_round_trips(packet in any::<Packet>()) {
            let mut wire = Vec::new();
            packet.encode(&mut wire).expect("should encode");
            let decoded = Packet::decode(&wire).expect("should decode");
            prop_assert_eq!(packet, decoded);
        }

        #[test]
        fn valid_checksum_accepts(payload in prop::collection::vec(any::<u8>(), 0..1024)) {
            let packet = Packet::new(1, payload, 0).expect("fits");
            prop_assert!(packet.is_valid());
        }

        #[test]
        fn flipped_payload_bit_invalidates_checksum(
            payload in prop::collection::vec(any::<u8>(), 1..1024),
            bit in 0u32..8,
        ) {
            let mut packet = Packet::new(1, payload.clone(), 0).expect("fits");
            let mut tampered = payload;
            tampered[0] ^= 1 << bit;
            packet.payload = Bytes::from(tampered);
            prop_assert!(!packet.is_valid());
        }
    }

    #[test]
    fn empty_payload_encodes_to_header_size() {
        let packet = Packet::new(1, Vec::new(), 0).expect("fits");
        let mut wire = Vec::new();
        let written = packet.encode(&mut wire).expect("should encode");
        assert_eq!(written, PacketHeader::SIZE);
        assert_eq!(wire.len(), PacketHeader::SIZE);
    }

    #[test]
    fn length_equal_to_header_size_decodes_empty_payload() {
        let packet = Packet::new(7, Vec::new(), 123).expect("fits");
        let mut wire = Vec::new();
        packet.encode(&mut wire).expect("should encode");
        let decoded = Packet::decode(&wire).expect("should decode");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn reject_truncated_body() {
        let packet = Packet::new(1, vec![1, 2, 3, 4, 5], 0).expect("fits");
        let mut wire = Vec::new();
        packet.encode(&mut wire).expect("should encode");
        wire.truncate(wire.len() - 2);
        let result = Packet::decode(&wire);
        assert!(matches!(result, Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn clock_skew_never_reports_expiry() {
        let packet = Packet::new(1, Vec::new(), 10_000).expect("fits");
        assert!(!packet.is_expired(1_000, 500));
    }

    #[test]
    fn expired_past_timeout() {
        let packet = Packet::new(1, Vec::new(), 1_000).expect("fits");
        assert!(packet.is_expired(5_000, 100));
        assert!(!packet.is_expired(1_050, 100));
    }

    #[test]
    fn encode_pooled_matches_plain_encode_for_small_and_large() {
        let pool = SharedBufferPool::new(1 << 20);
        let small = Packet::new(1, vec![0u8; 16], 0).expect("fits");
        let large = Packet::new(1, vec![0u8; STACK_THRESHOLD * 2], 0).expect("fits");

        let mut small_wire = Vec::new();
        small.encode(&mut small_wire).expect("encode");
        assert_eq!(small.encode_pooled(&pool).expect("encode").as_ref(), small_wire.as_slice());

        let mut large_wire = Vec::new();
        large.encode(&mut large_wire).expect("encode");
        assert_eq!(large.encode_pooled(&pool).expect("encode").as_ref(), large_wire.as_slice());
    }
}
