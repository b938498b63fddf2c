//! Wire protocol shared by the server and the client.
//!
//! This module defines the framing used on every ringnet connection: a fixed-size
//! [`Header`] followed by an opaque payload. It provides the types and logic required
//! to encode, decode and validate frames, plus the reassembly state used to rebuild
//! frames from the arbitrary partial reads a stream socket delivers.
//!
//! # Binary Format
//!
//! Every frame starts with an eight byte header:
//!
//! - `length` (`u32`): total frame size in bytes, header included.
//! - `kind` (`u32`): application defined packet type.
//!
//! Both fields are little-endian with no padding, followed immediately by
//! `length - HEADER_SIZE` payload bytes. Frames claiming more than the configured
//! maximum packet size are dropped by the receiver without being delivered, and
//! without tearing down the connection.
//!
//! # Key Components
//!
//! - [`Header`]: The fixed frame header.
//! - [`Frame`]: A borrowed, fully assembled frame.
//! - [`Assembler`]: Accumulates stream bytes until whole frames are available.
//! - [`ProtocolTransport`]: Blocking frame reader/writer over any `Read + Write`.
//!
//! # See Also
//!
//! - [`server`](crate::server): Completion engine delivering frames from many sessions.
//! - [`client`](crate::client): Client side of the same protocol.
mod assembler;
pub mod transport;

use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
    decode_from_slice, encode_into_slice,
};
use thiserror::Error;

pub use assembler::Assembler;
pub use transport::{ProtocolTransport, TransportError};

/// Encoded size of a [`Header`].
pub const HEADER_SIZE: usize = size_of::<u32>() * 2;

/// Largest frame accepted when nothing else is configured.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 8 * 1024;

/// Encoding used for every header on the wire.
pub(crate) fn wire() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame header needs 8 bytes, got {0}")]
    Truncated(usize),

    #[error("frame length {0} is shorter than its own header")]
    Malformed(u32),

    #[error("frame length {length} exceeds maximum packet size {max}")]
    Oversize { length: u32, max: u32 },

    #[error("payload of {0} bytes cannot be described by a frame header")]
    PayloadTooLarge(usize),

    #[error("header declares {length} bytes but frame carries {actual}")]
    LengthMismatch { length: u32, actual: usize },

    #[error("frame of {needed} bytes does not fit a {capacity} byte buffer")]
    Overflow { needed: usize, capacity: usize },

    #[error("failed to encode header: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode header: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Fixed header in front of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Header {
    /// Total frame length, header included.
    pub length: u32,
    /// Application packet type.
    pub kind: u32,
}

impl Header {
    /// Builds the header for a frame carrying `payload_len` bytes.
    pub fn new(kind: u32, payload_len: usize) -> Result<Self, FrameError> {
        let length = payload_len
            .checked_add(HEADER_SIZE)
            .and_then(|len| u32::try_from(len).ok())
            .ok_or(FrameError::PayloadTooLarge(payload_len))?;
        Ok(Self { length, kind })
    }

    /// Number of payload bytes following the header.
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }

    /// Checks the declared length against the header size and `max_packet_size`.
    pub fn validate(&self, max_packet_size: u32) -> Result<(), FrameError> {
        if (self.length as usize) < HEADER_SIZE {
            return Err(FrameError::Malformed(self.length));
        }
        if self.length > max_packet_size {
            return Err(FrameError::Oversize {
                length: self.length,
                max: max_packet_size,
            });
        }
        Ok(())
    }

    /// Writes the header into the first [`HEADER_SIZE`] bytes of `dst`.
    pub fn encode_into(&self, dst: &mut [u8]) -> Result<(), FrameError> {
        if dst.len() < HEADER_SIZE {
            return Err(FrameError::Overflow {
                needed: HEADER_SIZE,
                capacity: dst.len(),
            });
        }
        encode_into_slice(*self, &mut dst[..HEADER_SIZE], wire())?;
        Ok(())
    }

    /// Reads a header from the first [`HEADER_SIZE`] bytes of `src`.
    pub fn decode(src: &[u8]) -> Result<Self, FrameError> {
        if src.len() < HEADER_SIZE {
            return Err(FrameError::Truncated(src.len()));
        }
        let (header, _) = decode_from_slice(&src[..HEADER_SIZE], wire())?;
        Ok(header)
    }
}

/// Writes `header` and `payload` contiguously into `dst`, returning the frame length.
pub fn encode_frame(header: Header, payload: &[u8], dst: &mut [u8]) -> Result<usize, FrameError> {
    let len = header.length as usize;
    if header.payload_len() != payload.len() || len < HEADER_SIZE {
        return Err(FrameError::LengthMismatch {
            length: header.length,
            actual: HEADER_SIZE + payload.len(),
        });
    }
    if dst.len() < len {
        return Err(FrameError::Overflow {
            needed: len,
            capacity: dst.len(),
        });
    }

    header.encode_into(dst)?;
    dst[HEADER_SIZE..len].copy_from_slice(payload);
    Ok(len)
}

/// A complete frame borrowed from a receive buffer or packet ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    header: Header,
    bytes: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Wraps `bytes`, which must hold exactly one frame as described by its header.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FrameError> {
        let header = Header::decode(bytes)?;
        if header.length as usize != bytes.len() {
            return Err(FrameError::LengthMismatch {
                length: header.length,
                actual: bytes.len(),
            });
        }
        Ok(Self { header, bytes })
    }

    pub(crate) fn from_parts(header: Header, bytes: &'a [u8]) -> Self {
        Self { header, bytes }
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn kind(&self) -> u32 {
        self.header.kind
    }

    /// Bytes following the header.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// The whole frame, header included.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn to_packet(&self) -> Packet {
        Packet {
            header: self.header,
            payload: self.payload().to_vec(),
        }
    }
}

/// An owned frame, as returned by [`ProtocolTransport::read_packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: u32, payload: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        let payload = payload.into();
        let header = Header::new(kind, payload.len())?;
        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let header = Header {
            length: 20,
            kind: 5,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode_into(&mut buf).unwrap();

        assert_eq!(buf, [20, 0, 0, 0, 5, 0, 0, 0]);
        assert_eq!(Header::decode(&buf).unwrap(), header);
    }

    #[test]
    fn header_counts_itself() {
        let header = Header::new(9, 12).unwrap();
        assert_eq!(header.length, 20);
        assert_eq!(header.payload_len(), 12);
    }

    #[test]
    fn validate_bounds() {
        assert!(matches!(
            Header { length: 4, kind: 0 }.validate(64),
            Err(FrameError::Malformed(4))
        ));
        assert!(matches!(
            Header { length: 65, kind: 0 }.validate(64),
            Err(FrameError::Oversize { length: 65, max: 64 })
        ));
        assert!(Header { length: 64, kind: 0 }.validate(64).is_ok());
        assert!(Header { length: 8, kind: 0 }.validate(64).is_ok());
    }

    #[test]
    fn decode_needs_full_header() {
        assert!(matches!(
            Header::decode(&[1, 2, 3]),
            Err(FrameError::Truncated(3))
        ));
    }

    #[test]
    fn encode_frame_writes_header_and_payload() {
        let header = Header::new(3, 4).unwrap();
        let mut buf = [0u8; 32];
        let len = encode_frame(header, b"ping", &mut buf).unwrap();

        let frame = Frame::parse(&buf[..len]).unwrap();
        assert_eq!(frame.kind(), 3);
        assert_eq!(frame.payload(), b"ping");
    }

    #[test]
    fn encode_frame_rejects_mismatch_and_overflow() {
        let header = Header::new(3, 10).unwrap();
        let mut buf = [0u8; 32];
        assert!(matches!(
            encode_frame(header, b"short", &mut buf),
            Err(FrameError::LengthMismatch { .. })
        ));

        let header = Header::new(3, 30).unwrap();
        assert!(matches!(
            encode_frame(header, &[0; 30], &mut buf),
            Err(FrameError::Overflow {
                needed: 38,
                capacity: 32
            })
        ));
    }
}
