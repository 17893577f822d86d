//! Frame encoding/decoding for the session protocol
//!
//! Frame format (before obfuscation):
//! ```text
//! +--------+--------+--------+--------+
//! |          Stream ID (4B)           |
//! +--------+--------+--------+--------+
//! |                                   |
//! +           Sequence (8B)           +
//! |                                   |
//! +--------+--------+--------+--------+
//! | Closing|        Payload ...       |
//! +--------+--------+--------+--------+
//! ```
//!
//! One frame travels in one wire unit, so there is no length field: the
//! payload runs to the end of the unit.

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 13;

/// Largest payload a stream puts in one frame
///
/// Keeps an AEAD-sealed frame inside a 16 KiB record.
pub const MAX_PAYLOAD_SIZE: usize = 16384 - FRAME_HEADER_SIZE - 64;

/// What a frame closes, if anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Closing {
    /// Ordinary data
    Nothing = 0x00,
    /// Last frame of its stream
    Stream = 0x01,
    /// Peer is tearing down the whole session
    Session = 0x02,
}

impl TryFrom<u8> for Closing {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Closing::Nothing),
            0x01 => Ok(Closing::Stream),
            0x02 => Ok(Closing::Session),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown closing flag: {}",
                value
            ))),
        }
    }
}

/// A session frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream the frame belongs to
    pub stream_id: u32,
    /// Per-stream sequence number, starting at 0
    pub seq: u64,
    /// Closing flag
    pub closing: Closing,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a new data frame
    pub fn data(stream_id: u32, seq: u64, payload: Bytes) -> Self {
        Self {
            stream_id,
            seq,
            closing: Closing::Nothing,
            payload,
        }
    }

    /// Create a stream close frame
    pub fn close_stream(stream_id: u32, seq: u64) -> Self {
        Self {
            stream_id,
            seq,
            closing: Closing::Stream,
            payload: Bytes::new(),
        }
    }

    /// Create a session close frame
    pub fn close_session() -> Self {
        Self {
            stream_id: 0,
            seq: 0,
            closing: Closing::Session,
            payload: Bytes::new(),
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u32(self.stream_id);
        buf.put_u64(self.seq);
        buf.put_u8(self.closing as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one frame occupying all of `buf`
    pub fn decode(mut buf: Bytes) -> Result<Self, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TunnelError::InvalidFrame(format!(
                "Frame too short: {} bytes",
                buf.len()
            )));
        }

        let stream_id = buf.get_u32();
        let seq = buf.get_u64();
        let closing = Closing::try_from(buf.get_u8())?;

        Ok(Self {
            stream_id,
            seq,
            closing,
            payload: buf,
        })
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}
