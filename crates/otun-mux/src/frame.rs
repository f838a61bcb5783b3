//! Wire frames for the multiplexed session.

use bytes::{BufMut, Bytes, BytesMut};

use crate::MuxError;

/// Stream identifier, stable for the lifetime of the session.
///
/// The client side of a session allocates odd ids, the server side even
/// ones, so the two peers can never collide.
pub type StreamId = u32;

/// Largest payload carried by a single frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Initial per-stream flow control window, in bytes.
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Announces a new stream opened by the sender.
    Open = 0,
    /// Payload bytes for a stream.
    Data = 1,
    /// Half-closes the sender's write side; with RST, aborts the stream.
    Close = 2,
    /// Grants the peer additional send-window credit for a stream.
    WindowUpdate = 3,
    /// Session keepalive; with ACK, answers a previous ping.
    Ping = 4,
    /// Orderly session shutdown.
    GoAway = 5,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::WindowUpdate),
            4 => Ok(FrameType::Ping),
            5 => Ok(FrameType::GoAway),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const ACK: u8 = 0b0000_0001;
    pub const RST: u8 = 0b0000_0010;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// A single multiplexer frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Header size: stream_id (4) + frame_type (1) + flags (1) + length (4).
    pub const HEADER_LEN: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    /// Half-close: the sender will write no more data on this stream.
    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    /// Abortive close.
    pub fn reset(stream_id: StreamId) -> Self {
        Self::close(stream_id).with_flags(FrameFlags::new().with_rst())
    }

    pub fn window_update(stream_id: StreamId, credit: u32) -> Self {
        Self::new(
            stream_id,
            FrameType::WindowUpdate,
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    pub fn ping() -> Self {
        Self::new(0, FrameType::Ping, Bytes::new())
    }

    pub fn pong() -> Self {
        Self::ping().with_flags(FrameFlags::new().with_ack())
    }

    pub fn go_away() -> Self {
        Self::new(0, FrameType::GoAway, Bytes::new())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encodes the frame into a contiguous buffer.
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        if self.payload.len() > MAX_FRAME_LEN {
            return Err(MuxError::FrameTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decodes a frame header, returning the stream id, type, flags and
    /// payload length still to be read.
    pub fn decode_header(
        header: &[u8; Self::HEADER_LEN],
    ) -> Result<(StreamId, FrameType, FrameFlags, usize), MuxError> {
        let stream_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let frame_type = FrameType::try_from(header[4])?;
        let flags = FrameFlags::from_u8(header[5]);
        let len = u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;

        if len > MAX_FRAME_LEN {
            return Err(MuxError::FrameTooLarge(len));
        }

        Ok((stream_id, frame_type, flags, len))
    }
}
