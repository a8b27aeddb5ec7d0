//! Binary frame format.
//!
//! Every transport message carries exactly one frame: a fixed 38-byte header
//! followed by an opaque payload. The payload length is the remainder of the
//! transport message and is never written into the header.
//!
//! ```text
//! +---------+----------+--------+--------+--------+-----------+
//! | type_id | reserved | msg_id | source | target | timestamp |
//! | 2 bytes | 4 bytes  | 8 bytes| 8 bytes| 8 bytes|  8 bytes  |
//! +---------+----------+--------+--------+--------+-----------+
//! | payload (rest of the transport message)                   |
//! +-----------------------------------------------------------+
//! ```
//!
//! All integers are little-endian. Reserved bytes are written as zero and
//! ignored on decode.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes (2+4+8+8+8+8 = 38).
pub const HEADER_SIZE: usize = 38;

const RESERVED: [u8; 4] = [0; 4];

/// Decoded frame header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload discriminator, see [`crate::message::types`].
    pub type_id: u16,
    /// Correlation identifier linking a request to its reply.
    pub msg_id: u64,
    /// Sender device UID (0 = unauthenticated).
    pub source: u64,
    /// Target device UID (0 = broadcast / hub-addressed).
    pub target: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl FrameHeader {
    /// Creates a header stamped with the current time.
    pub fn new(type_id: u16, msg_id: u64, source: u64, target: u64) -> Self {
        Self {
            type_id,
            msg_id,
            source,
            target,
            timestamp: crate::now_millis(),
        }
    }

    /// Returns whether the header addresses every connection.
    pub fn is_broadcast(&self) -> bool {
        self.target == 0
    }

    /// Writes the 38 header bytes into `buf`.
    pub fn encode_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.type_id);
        buf.put_slice(&RESERVED);
        buf.put_u64_le(self.msg_id);
        buf.put_u64_le(self.source);
        buf.put_u64_le(self.target);
        buf.put_i64_le(self.timestamp);
    }

    /// Encodes the header into a fixed-size array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut cursor = &mut out[..];
        self.encode_to(&mut cursor);
        out
    }

    /// Decodes a header from the first 38 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::ShortBuffer {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }

        let mut cur = &buf[..HEADER_SIZE];
        let type_id = cur.get_u16_le();
        cur.advance(RESERVED.len());
        let msg_id = cur.get_u64_le();
        let source = cur.get_u64_le();
        let target = cur.get_u64_le();
        let timestamp = cur.get_i64_le();

        Ok(Self {
            type_id,
            msg_id,
            source,
            target,
            timestamp,
        })
    }
}

/// Encodes a header and payload into one transport message.
pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.encode_to(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Splits a transport message into its header and payload slice.
pub fn decode_frame(buf: &[u8]) -> Result<(FrameHeader, &[u8]), ProtocolError> {
    let header = FrameHeader::decode(buf)?;
    Ok((header, &buf[HEADER_SIZE..]))
}

/// An owned frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Bytes {
        encode_frame(&self.header, &self.payload)
    }

    /// Decodes a frame without copying the payload.
    pub fn decode(bytes: Bytes) -> Result<Self, ProtocolError> {
        let header = FrameHeader::decode(&bytes)?;
        let payload = bytes.slice(HEADER_SIZE..);
        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_header() -> FrameHeader {
        FrameHeader {
            type_id: 10,
            msg_id: 0x0102_0304_0506_0708,
            source: 42,
            target: 7,
            timestamp: 1_700_000_000_123,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(FrameHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let encoded = sample_header().encode();
        assert_eq!(&encoded[0..2], &[10, 0]);
        assert_eq!(&encoded[2..6], &[0, 0, 0, 0]);
        assert_eq!(&encoded[6..14], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&encoded[14..22], &42u64.to_le_bytes());
        assert_eq!(&encoded[22..30], &7u64.to_le_bytes());
        assert_eq!(&encoded[30..38], &1_700_000_000_123i64.to_le_bytes());
    }

    #[test]
    fn test_reserved_bytes_ignored_on_decode() {
        let mut encoded = sample_header().encode();
        encoded[2..6].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(FrameHeader::decode(&encoded).unwrap(), sample_header());
    }

    #[test]
    fn test_short_header() {
        let result = FrameHeader::decode(&[0u8; 37]);
        assert_eq!(
            result,
            Err(ProtocolError::ShortBuffer {
                needed: 38,
                available: 37
            })
        );
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(sample_header(), Bytes::from_static(b"hello"));
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + 5);

        let decoded = Frame::decode(encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_frame_slices_payload() {
        let bytes = encode_frame(&sample_header(), b"abc");
        let (header, payload) = decode_frame(&bytes).unwrap();
        assert_eq!(header, sample_header());
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_empty_payload() {
        let bytes = encode_frame(&sample_header(), &[]);
        let (_, payload) = decode_frame(&bytes).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_unknown_type_id_decodes() {
        let mut header = sample_header();
        header.type_id = 0xFFFF;
        let bytes = encode_frame(&header, b"x");
        assert_eq!(decode_frame(&bytes).unwrap().0.type_id, 0xFFFF);
    }

    #[test]
    fn test_is_broadcast() {
        let mut header = sample_header();
        assert!(!header.is_broadcast());
        header.target = 0;
        assert!(header.is_broadcast());
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            type_id in any::<u16>(),
            msg_id in any::<u64>(),
            source in any::<u64>(),
            target in any::<u64>(),
            timestamp in any::<i64>(),
        ) {
            let header = FrameHeader { type_id, msg_id, source, target, timestamp };
            prop_assert_eq!(FrameHeader::decode(&header.encode()).unwrap(), header);
        }

        #[test]
        fn prop_truncated_header_is_error(cut in 0usize..HEADER_SIZE) {
            let bytes = encode_frame(&sample_header(), b"payload");
            let is_short = matches!(
                decode_frame(&bytes[..cut]),
                Err(ProtocolError::ShortBuffer { .. })
            );
            prop_assert!(is_short);
        }
    }
}
