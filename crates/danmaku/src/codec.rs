//! Binary frame codec for the live chat WebSocket protocol.
//!
//! Every frame starts with a fixed 16 byte big-endian header:
//!
//! ```text
//! offset 0..4   total length (header + body)
//! offset 4..6   header length (16)
//! offset 6..8   protocol version (0 plain, 1 heartbeat, 2 zlib, 3 brotli)
//! offset 8..12  operation code
//! offset 12..16 sequence id
//! offset 16..   body
//! ```
//!
//! Compressed bodies (versions 2 and 3) hold a concatenation of complete
//! frames, which are decoded recursively and flattened in order.

use std::io::{Read, Write};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::DecodeError;

/// Length of the fixed frame header.
pub const HEADER_LEN: usize = 16;

/// Sequence id written on outbound frames. The server ignores it.
pub const DEFAULT_SEQUENCE: u32 = 1;

/// Operation code carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Heartbeat,
    HeartbeatReply,
    Message,
    Auth,
    AuthReply,
    /// Any other code. Kept so unknown frames survive decoding.
    Unknown(u32),
}

impl Operation {
    pub const fn code(self) -> u32 {
        match self {
            Self::Heartbeat => 2,
            Self::HeartbeatReply => 3,
            Self::Message => 5,
            Self::Auth => 7,
            Self::AuthReply => 8,
            Self::Unknown(code) => code,
        }
    }
}

impl From<u32> for Operation {
    fn from(code: u32) -> Self {
        match code {
            2 => Self::Heartbeat,
            3 => Self::HeartbeatReply,
            5 => Self::Message,
            7 => Self::Auth,
            8 => Self::AuthReply,
            other => Self::Unknown(other),
        }
    }
}

impl From<Operation> for u32 {
    fn from(op: Operation) -> Self {
        op.code()
    }
}

/// Protocol version, which selects the body compression scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// Uncompressed JSON body
    Plain,
    /// Uncompressed body used by heartbeat and auth frames
    HeartbeatPlain,
    /// zlib-compressed batch of frames
    Zlib,
    /// brotli-compressed batch of frames
    Brotli,
}

impl ProtocolVersion {
    pub const fn code(self) -> u16 {
        match self {
            Self::Plain => 0,
            Self::HeartbeatPlain => 1,
            Self::Zlib => 2,
            Self::Brotli => 3,
        }
    }

    /// Whether the body of a frame with this version is a compressed batch.
    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::Zlib | Self::Brotli)
    }
}

impl TryFrom<u16> for ProtocolVersion {
    type Error = DecodeError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Plain),
            1 => Ok(Self::HeartbeatPlain),
            2 => Ok(Self::Zlib),
            3 => Ok(Self::Brotli),
            other => Err(DecodeError::UnsupportedVersion(other)),
        }
    }
}

/// A single protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: ProtocolVersion,
    pub operation: Operation,
    pub sequence: u32,
    pub body: Bytes,
}

impl Frame {
    /// Create an outbound frame tagged with the heartbeat/auth version.
    pub fn new(operation: Operation, body: impl Into<Bytes>) -> Self {
        Self {
            version: ProtocolVersion::HeartbeatPlain,
            operation,
            sequence: DEFAULT_SEQUENCE,
            body: body.into(),
        }
    }

    /// Set the protocol version.
    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    /// Set the sequence id.
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Total encoded length, header included.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Serialize this frame. See [`encode`].
    pub fn encode(&self) -> Bytes {
        encode(self)
    }
}

/// Limits applied while decoding inbound buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Maximum nesting of compressed frames inside compressed frames.
    pub max_depth: usize,
    /// Maximum number of bytes inflated across one inbound buffer.
    pub max_decompressed_size: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_depth: 4,
            max_decompressed_size: 8 * 1024 * 1024,
        }
    }
}

/// Serialize a frame: fixed big-endian header followed by the body.
///
/// The body is written as-is; outbound frames are never compressed.
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    encode_into(frame, &mut buf);
    buf.freeze()
}

fn encode_into(frame: &Frame, buf: &mut BytesMut) {
    buf.put_u32(frame.encoded_len() as u32);
    buf.put_u16(HEADER_LEN as u16);
    buf.put_u16(frame.version.code());
    buf.put_u32(frame.operation.code());
    buf.put_u32(frame.sequence);
    buf.put_slice(&frame.body);
}

/// Serialize several frames back to back.
pub fn encode_all(frames: &[Frame]) -> Bytes {
    let len = frames.iter().map(Frame::encoded_len).sum();
    let mut buf = BytesMut::with_capacity(len);
    for frame in frames {
        encode_into(frame, &mut buf);
    }
    buf.freeze()
}

/// Build a compressed batch frame holding `frames`, the way the server
/// batches notifications.
pub fn compress_batch(
    version: ProtocolVersion,
    operation: Operation,
    frames: &[Frame],
) -> std::io::Result<Frame> {
    let raw = encode_all(frames);
    let body = match version {
        ProtocolVersion::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw)?;
            encoder.finish()?
        }
        ProtocolVersion::Brotli => {
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
                writer.write_all(&raw)?;
                writer.flush()?;
            }
            out
        }
        ProtocolVersion::Plain | ProtocolVersion::HeartbeatPlain => raw.to_vec(),
    };

    Ok(Frame {
        version,
        operation,
        sequence: DEFAULT_SEQUENCE,
        body: Bytes::from(body),
    })
}

/// Decode an inbound buffer with the default limits.
pub fn decode(data: &[u8]) -> Result<Vec<Frame>, DecodeError> {
    decode_with_limits(data, &DecodeLimits::default())
}

/// Decode an inbound buffer into a flat list of frames.
///
/// Compressed frames are inflated and their contents decoded recursively, so
/// the result only ever holds uncompressed frames, in wire order.
pub fn decode_with_limits(data: &[u8], limits: &DecodeLimits) -> Result<Vec<Frame>, DecodeError> {
    let mut frames = Vec::new();
    let mut budget = limits.max_decompressed_size;
    decode_buffer(data, 0, limits, &mut budget, &mut frames)?;
    Ok(frames)
}

fn decode_buffer(
    data: &[u8],
    depth: usize,
    limits: &DecodeLimits,
    budget: &mut usize,
    out: &mut Vec<Frame>,
) -> Result<(), DecodeError> {
    let mut offset = 0;

    while offset < data.len() {
        let remaining = &data[offset..];
        if remaining.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                available: remaining.len(),
            });
        }

        let total_len = BigEndian::read_u32(&remaining[0..4]) as usize;
        let header_len = BigEndian::read_u16(&remaining[4..6]);
        let version = BigEndian::read_u16(&remaining[6..8]);
        let operation = BigEndian::read_u32(&remaining[8..12]);
        let sequence = BigEndian::read_u32(&remaining[12..16]);

        if (header_len as usize) < HEADER_LEN {
            return Err(DecodeError::InvalidHeaderLength(header_len));
        }
        if total_len < header_len as usize || total_len > remaining.len() {
            return Err(DecodeError::InvalidLength {
                declared: total_len,
                header_len: header_len as usize,
                available: remaining.len(),
            });
        }

        let version = ProtocolVersion::try_from(version)?;
        let body = &remaining[header_len as usize..total_len];

        if version.is_compressed() {
            if depth >= limits.max_depth {
                return Err(DecodeError::DepthExceeded(limits.max_depth));
            }
            let inflated = inflate(version, body, budget, limits.max_decompressed_size)?;
            decode_buffer(&inflated, depth + 1, limits, budget, out)?;
        } else {
            out.push(Frame {
                version,
                operation: Operation::from(operation),
                sequence,
                body: Bytes::copy_from_slice(body),
            });
        }

        offset += total_len;
    }

    Ok(())
}

/// Inflate a compressed body, charging the output against `budget`.
fn inflate(
    version: ProtocolVersion,
    body: &[u8],
    budget: &mut usize,
    limit: usize,
) -> Result<Vec<u8>, DecodeError> {
    let (scheme, reader): (&'static str, Box<dyn Read + '_>) = match version {
        ProtocolVersion::Zlib => ("zlib", Box::new(ZlibDecoder::new(body))),
        ProtocolVersion::Brotli => ("brotli", Box::new(brotli::Decompressor::new(body, 4096))),
        ProtocolVersion::Plain | ProtocolVersion::HeartbeatPlain => return Ok(body.to_vec()),
    };

    // Read one byte past the budget so overflow is detectable.
    let mut inflated = Vec::new();
    reader
        .take(*budget as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| DecodeError::Decompress {
            scheme,
            reason: e.to_string(),
        })?;

    if inflated.len() > *budget {
        return Err(DecodeError::SizeExceeded { limit });
    }
    *budget -= inflated.len();
    Ok(inflated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn message(body: &str) -> Frame {
        Frame::new(Operation::Message, body.as_bytes().to_vec()).with_version(ProtocolVersion::Plain)
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::new(Operation::Auth, &b"test"[..]);
        let packet = frame.encode();

        assert_eq!(BigEndian::read_u32(&packet[0..4]), 20);
        assert_eq!(BigEndian::read_u16(&packet[4..6]), 16);
        assert_eq!(BigEndian::read_u16(&packet[6..8]), 1);
        assert_eq!(BigEndian::read_u32(&packet[8..12]), 7);
        assert_eq!(BigEndian::read_u32(&packet[12..16]), 1);
        assert_eq!(&packet[16..], b"test");
    }

    #[test]
    fn test_operation_codes() {
        assert_eq!(Operation::from(2), Operation::Heartbeat);
        assert_eq!(Operation::from(3), Operation::HeartbeatReply);
        assert_eq!(Operation::from(5), Operation::Message);
        assert_eq!(Operation::from(7), Operation::Auth);
        assert_eq!(Operation::from(8), Operation::AuthReply);
        assert_eq!(Operation::from(42), Operation::Unknown(42));
        assert_eq!(u32::from(Operation::Unknown(42)), 42);
    }

    #[test]
    fn test_decode_zlib_batch_flattens_in_order() {
        let inner: Vec<Frame> = (0..5).map(|i| message(&format!("{{\"n\":{i}}}"))).collect();
        let batch = compress_batch(ProtocolVersion::Zlib, Operation::Message, &inner).unwrap();

        let decoded = decode(&batch.encode()).unwrap();
        assert_eq!(decoded, inner);
    }

    #[test]
    fn test_decode_brotli_batch_flattens_in_order() {
        let inner = vec![message("a"), message("bb"), message("ccc")];
        let batch = compress_batch(ProtocolVersion::Brotli, Operation::Message, &inner).unwrap();

        let decoded = decode(&batch.encode()).unwrap();
        assert_eq!(decoded, inner);
    }

    #[test]
    fn test_decode_empty_compressed_batch() {
        let batch = compress_batch(ProtocolVersion::Zlib, Operation::Message, &[]).unwrap();
        assert!(decode(&batch.encode()).unwrap().is_empty());
    }

    #[test]
    fn test_decode_nested_compression() {
        let leaf = vec![message("x"), message("y")];
        let inner = compress_batch(ProtocolVersion::Brotli, Operation::Message, &leaf).unwrap();
        let outer =
            compress_batch(ProtocolVersion::Zlib, Operation::Message, &[inner, message("z")])
                .unwrap();

        let decoded = decode(&outer.encode()).unwrap();
        let bodies: Vec<&[u8]> = decoded.iter().map(|f| f.body.as_ref()).collect();
        assert_eq!(bodies, vec![b"x".as_slice(), b"y".as_slice(), b"z".as_slice()]);
    }

    #[test]
    fn test_decode_concatenated_top_level() {
        let frames = vec![message("one"), Frame::new(Operation::HeartbeatReply, vec![0u8, 0, 0, 9])];
        let decoded = decode(&encode_all(&frames)).unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_decode_truncated_header() {
        let err = decode(&[0, 0, 0, 20, 0, 16]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                needed: 16,
                available: 6
            }
        );
    }

    #[test]
    fn test_decode_length_past_buffer() {
        let mut packet = message("hello").encode().to_vec();
        packet.truncate(18);
        assert!(matches!(
            decode(&packet),
            Err(DecodeError::InvalidLength { declared: 21, .. })
        ));
    }

    #[test]
    fn test_decode_length_shorter_than_header() {
        let mut packet = message("hello").encode().to_vec();
        BigEndian::write_u32(&mut packet[0..4], 8);
        assert!(matches!(decode(&packet), Err(DecodeError::InvalidLength { .. })));
    }

    #[test]
    fn test_decode_bad_header_length() {
        let mut packet = message("hello").encode().to_vec();
        BigEndian::write_u16(&mut packet[4..6], 4);
        assert_eq!(decode(&packet), Err(DecodeError::InvalidHeaderLength(4)));
    }

    #[test]
    fn test_decode_unknown_version() {
        let mut packet = message("hello").encode().to_vec();
        BigEndian::write_u16(&mut packet[6..8], 9);
        assert_eq!(decode(&packet), Err(DecodeError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_decode_corrupt_zlib_body() {
        let frame = Frame::new(Operation::Message, vec![0xdeu8, 0xad, 0xbe, 0xef])
            .with_version(ProtocolVersion::Zlib);
        assert!(matches!(
            decode(&frame.encode()),
            Err(DecodeError::Decompress { scheme: "zlib", .. })
        ));
    }

    #[test]
    fn test_decode_depth_limit() {
        let mut frame = message("deep");
        for _ in 0..3 {
            frame = compress_batch(ProtocolVersion::Zlib, Operation::Message, &[frame]).unwrap();
        }
        let limits = DecodeLimits {
            max_depth: 2,
            ..DecodeLimits::default()
        };
        assert_eq!(
            decode_with_limits(&frame.encode(), &limits),
            Err(DecodeError::DepthExceeded(2))
        );

        let limits = DecodeLimits {
            max_depth: 3,
            ..DecodeLimits::default()
        };
        assert_eq!(decode_with_limits(&frame.encode(), &limits).unwrap().len(), 1);
    }

    #[test]
    fn test_decode_size_limit() {
        let big = "x".repeat(4096);
        let batch = compress_batch(ProtocolVersion::Zlib, Operation::Message, &[message(&big)])
            .unwrap();
        let limits = DecodeLimits {
            max_decompressed_size: 1024,
            ..DecodeLimits::default()
        };
        assert_eq!(
            decode_with_limits(&batch.encode(), &limits),
            Err(DecodeError::SizeExceeded { limit: 1024 })
        );
    }

    proptest! {
        #[test]
        fn prop_plain_round_trip(
            op in any::<u32>(),
            seq in any::<u32>(),
            body in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let frame = Frame {
                version: ProtocolVersion::Plain,
                operation: Operation::from(op),
                sequence: seq,
                body: Bytes::from(body),
            };
            prop_assert_eq!(decode(&encode(&frame)).unwrap(), vec![frame]);
        }

        #[test]
        fn prop_zlib_batch_preserves_count(count in 0usize..20) {
            let inner: Vec<Frame> = (0..count).map(|i| message(&i.to_string())).collect();
            let batch = compress_batch(ProtocolVersion::Zlib, Operation::Message, &inner).unwrap();
            prop_assert_eq!(decode(&batch.encode()).unwrap(), inner);
        }
    }
}
