//! Frame encoding/decoding for the tunnel wire protocol.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! +------+-----------+----------+----------------+-----------------+
//! | type | stream_id | sequence | payload_length | payload ...     |
//! |  1B  |    4B     |    4B    |       4B       | payload_length  |
//! +------+-----------+----------+----------------+-----------------+
//! ```
//!
//! [`encode`] and [`decode`] are pure transforms over byte buffers.
//! [`FrameCodec`] wraps them for `FramedRead`/`FramedWrite`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ErrorCode, TunnelError};

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 13;

/// Upper bound on `payload_length`. Larger values are rejected before any
/// payload byte is buffered.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    HelloAck = 0x02,
    OpenStream = 0x03,
    Data = 0x04,
    WindowUpdate = 0x05,
    CloseStream = 0x06,
    Ping = 0x07,
    Pong = 0x08,
    Error = 0x09,
}

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::HelloAck => "HELLO_ACK",
            Self::OpenStream => "OPEN_STREAM",
            Self::Data => "DATA",
            Self::WindowUpdate => "WINDOW_UPDATE",
            Self::CloseStream => "CLOSE_STREAM",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Error => "ERROR",
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, TunnelError> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloAck),
            0x03 => Ok(Self::OpenStream),
            0x04 => Ok(Self::Data),
            0x05 => Ok(Self::WindowUpdate),
            0x06 => Ok(Self::CloseStream),
            0x07 => Ok(Self::Ping),
            0x08 => Ok(Self::Pong),
            0x09 => Ok(Self::Error),
            other => Err(TunnelError::Framing(format!(
                "unknown frame type 0x{other:02x}"
            ))),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    /// 0 for connection-level frames.
    pub stream_id: u32,
    pub sequence: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, stream_id: u32, sequence: u32, payload: Bytes) -> Self {
        Self {
            frame_type,
            stream_id,
            sequence,
            payload,
        }
    }

    pub fn open_stream(stream_id: u32) -> Self {
        Self::new(FrameType::OpenStream, stream_id, 0, Bytes::new())
    }

    pub fn data(stream_id: u32, sequence: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, sequence, payload)
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self::new(FrameType::WindowUpdate, stream_id, 0, payload.freeze())
    }

    pub fn close_stream(stream_id: u32) -> Self {
        Self::new(FrameType::CloseStream, stream_id, 0, Bytes::new())
    }

    /// Ping carrying an opaque 8-byte token (the sender's clock in ms).
    pub fn ping(sequence: u32, token: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(token);
        Self::new(FrameType::Ping, 0, sequence, payload.freeze())
    }

    /// Pong echoing the sequence and payload of `ping`.
    pub fn pong(ping: &Frame) -> Self {
        Self::new(FrameType::Pong, 0, ping.sequence, ping.payload.clone())
    }

    pub fn error(stream_id: u32, code: ErrorCode, message: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + message.len());
        payload.put_u16(code as u16);
        payload.extend_from_slice(message.as_bytes());
        Self::new(FrameType::Error, stream_id, 0, payload.freeze())
    }

    /// Parse a `WINDOW_UPDATE` increment.
    pub fn window_increment(&self) -> Result<u32, TunnelError> {
        if self.payload.len() != 4 {
            return Err(TunnelError::Framing(format!(
                "WINDOW_UPDATE payload must be 4 bytes, got {}",
                self.payload.len()
            )));
        }
        Ok((&self.payload[..]).get_u32())
    }

    /// Parse a PING/PONG token.
    pub fn ping_token(&self) -> Result<u64, TunnelError> {
        if self.payload.len() != 8 {
            return Err(TunnelError::Framing(format!(
                "{} payload must be 8 bytes, got {}",
                self.frame_type.as_str(),
                self.payload.len()
            )));
        }
        Ok((&self.payload[..]).get_u64())
    }

    /// Parse an `ERROR` payload into `(code, message)`.
    pub fn error_parts(&self) -> Result<(ErrorCode, String), TunnelError> {
        if self.payload.len() < 2 {
            return Err(TunnelError::Framing("ERROR payload shorter than 2 bytes".into()));
        }
        let mut buf = &self.payload[..];
        let code = ErrorCode::from_u16(buf.get_u16());
        let message = String::from_utf8_lossy(buf).into_owned();
        Ok((code, message))
    }
}

/// Append the wire form of `frame` to `dst`.
pub fn encode(frame: &Frame, dst: &mut BytesMut) -> Result<(), TunnelError> {
    let len = frame.payload.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(TunnelError::Framing(format!(
            "payload of {len} bytes exceeds maximum {MAX_PAYLOAD_LEN}"
        )));
    }
    dst.reserve(HEADER_LEN + len);
    dst.put_u8(frame.frame_type as u8);
    dst.put_u32(frame.stream_id);
    dst.put_u32(frame.sequence);
    #[allow(clippy::cast_possible_truncation)]
    dst.put_u32(len as u32);
    dst.extend_from_slice(&frame.payload);
    Ok(())
}

/// Encode a single frame into a fresh buffer.
pub fn encode_to_bytes(frame: &Frame) -> Result<Bytes, TunnelError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
    encode(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Try to take one frame off the front of `src`.
///
/// Returns `Ok(None)` when more bytes are needed. The type byte and the
/// length field are validated as soon as the header is complete, so an
/// oversized or unknown frame fails without waiting for its payload.
pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, TunnelError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    let frame_type = FrameType::try_from(src[0])?;
    let len = u32::from_be_bytes([src[9], src[10], src[11], src[12]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(TunnelError::Framing(format!(
            "payload_length {len} exceeds maximum {MAX_PAYLOAD_LEN}"
        )));
    }

    if src.len() < HEADER_LEN + len {
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }

    src.advance(1);
    let stream_id = src.get_u32();
    let sequence = src.get_u32();
    src.advance(4);
    let payload = src.split_to(len).freeze();

    Ok(Some(Frame {
        frame_type,
        stream_id,
        sequence,
        payload,
    }))
}

/// `tokio_util` codec over [`encode`]/[`decode`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TunnelError> {
        decode(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TunnelError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TunnelError> {
        encode(&frame, dst)
    }
}
