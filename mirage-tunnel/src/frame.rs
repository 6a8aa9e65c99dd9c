//! The 5-byte frame header of the stream mux protocol.
//!
//! Byte 0 packs the protocol tag (bit 0) and the stream op (bits 1-2); the
//! remaining bits must be zero. Bytes 1-2 carry the stream id, bytes 3-4 the
//! body length, both big-endian. A frame never exceeds 65 536 bytes in total,
//! so the body is capped at 65 531.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HEAD_LENGTH: usize = 5;
pub const MAX_FRAME_SIZE: usize = 1 << 16;
pub const MAX_BODY_LENGTH: usize = MAX_FRAME_SIZE - HEAD_LENGTH;

const PROTO_TYPE_MASK: u8 = 0x01;
const STREAM_TYPE_MASK: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    New = 0x00,
    Del = 0x01,
    Data = 0x02,
}

impl StreamType {
    fn from_bits(bits: u8) -> Option<StreamType> {
        match bits {
            0x00 => Some(StreamType::New),
            0x01 => Some(StreamType::Del),
            0x02 => Some(StreamType::Data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtoType {
    Tcp = 0x00,
    Udp = 0x01,
}

/// Decoded form of the 5-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHead {
    pub stream_type: StreamType,
    pub proto_type: ProtoType,
    pub stream_id: u16,
    pub body_length: u16,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown stream op {0:#04x}")]
    BadStreamType(u8),
    #[error("frame body length {0} exceeds {max}", max = MAX_BODY_LENGTH)]
    Oversize(u16),
}

impl FrameHead {
    pub fn new(stream_type: StreamType, proto_type: ProtoType, stream_id: u16) -> FrameHead {
        FrameHead {
            stream_type,
            proto_type,
            stream_id,
            body_length: 0,
        }
    }

    pub fn encode(&self, data: &mut [u8; HEAD_LENGTH]) {
        data[0] = ((self.stream_type as u8 & STREAM_TYPE_MASK) << 1)
            | (self.proto_type as u8 & PROTO_TYPE_MASK);
        data[1..3].copy_from_slice(&self.stream_id.to_be_bytes());
        data[3..5].copy_from_slice(&self.body_length.to_be_bytes());
    }

    pub fn decode(data: &[u8; HEAD_LENGTH]) -> Result<FrameHead, FrameError> {
        let stream_bits = (data[0] >> 1) & STREAM_TYPE_MASK;
        let stream_type =
            StreamType::from_bits(stream_bits).ok_or(FrameError::BadStreamType(stream_bits))?;
        let proto_type = if data[0] & PROTO_TYPE_MASK == 0 {
            ProtoType::Tcp
        } else {
            ProtoType::Udp
        };
        let stream_id = u16::from_be_bytes([data[1], data[2]]);
        let body_length = u16::from_be_bytes([data[3], data[4]]);
        if body_length as usize > MAX_BODY_LENGTH {
            return Err(FrameError::Oversize(body_length));
        }
        Ok(FrameHead {
            stream_type,
            proto_type,
            stream_id,
            body_length,
        })
    }
}

/// A whole frame as passed between tasks.
#[derive(Debug, Clone)]
pub struct Frame {
    pub head: FrameHead,
    pub body: Bytes,
}

impl Frame {
    pub fn new(stream_type: StreamType, stream_id: u16, body: Bytes) -> Frame {
        debug_assert!(body.len() <= MAX_BODY_LENGTH);
        Frame {
            head: FrameHead {
                stream_type,
                proto_type: ProtoType::Tcp,
                stream_id,
                body_length: body.len() as u16,
            },
            body,
        }
    }

    /// Header plus body, ready for the transport.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEAD_LENGTH + self.body.len()];
        let mut head = [0u8; HEAD_LENGTH];
        self.head.encode(&mut head);
        out[..HEAD_LENGTH].copy_from_slice(&head);
        out[HEAD_LENGTH..].copy_from_slice(&self.body);
        out
    }
}

/// Read one whole frame off the transport: a full header read, then a full
/// read of exactly the advertised body. Short reads and header violations
/// are errors, and the caller must treat them as fatal for the session.
///
/// `buf` is scratch space of at least [`MAX_BODY_LENGTH`] bytes.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<Frame> {
    let mut head_buf = [0u8; HEAD_LENGTH];
    reader.read_exact(&mut head_buf).await?;
    let head =
        FrameHead::decode(&head_buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = head.body_length as usize;
    reader.read_exact(&mut buf[..len]).await?;
    Ok(Frame {
        head,
        body: Bytes::copy_from_slice(&buf[..len]),
    })
}
