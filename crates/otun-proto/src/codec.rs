//! Streaming codec for control-channel messages.
//!
//! Messages are whitespace-separated JSON objects. The decoder advances
//! across adjacent values with serde_json's streaming deserializer, so no
//! explicit length prefix or line framing is involved and whitespace
//! inside payloads is irrelevant.

use bytes::{Buf, BytesMut};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::ControlMessage;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("control stream closed")]
    StreamClosed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads and writes control messages over a single logical stream.
///
/// The channel buffers at most the decoder's natural lookahead beyond one
/// message; bytes following a decoded value stay in the buffer for the
/// next call.
pub struct ControlChannel<S> {
    stream: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ControlChannel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Sends a single message, terminated by a newline separator.
    pub async fn send(&mut self, msg: &ControlMessage) -> Result<(), CodecError> {
        let mut data = serde_json::to_vec(msg)
            .map_err(|e| CodecError::MalformedMessage(e.to_string()))?;
        data.push(b'\n');
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads the next message.
    ///
    /// Decodes the next JSON value, peeks at its `type` tag and parses the
    /// complete value into the matching variant. Returns
    /// [`CodecError::StreamClosed`] on a clean end of stream.
    pub async fn recv(&mut self) -> Result<ControlMessage, CodecError> {
        loop {
            if let Some((value, consumed)) = self.decode_next()? {
                self.buf.advance(consumed);
                return dispatch(value);
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
                    return Err(CodecError::StreamClosed);
                }
                return Err(CodecError::MalformedMessage(
                    "truncated message at end of stream".to_string(),
                ));
            }
        }
    }

    /// Tries to decode one complete JSON value from the buffer, returning
    /// the value and the number of bytes it occupied (including leading
    /// whitespace). `None` means more data is needed.
    fn decode_next(&self) -> Result<Option<(Value, usize)>, CodecError> {
        let mut values = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => Ok(Some((value, values.byte_offset()))),
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(CodecError::MalformedMessage(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Parses a raw JSON value into a [`ControlMessage`] based on its tag.
fn dispatch(value: Value) -> Result<ControlMessage, CodecError> {
    let tag = match value.get("type").and_then(Value::as_str) {
        Some(tag) => tag.to_string(),
        None => {
            return Err(CodecError::MalformedMessage(
                "missing type field".to_string(),
            ))
        }
    };

    match tag.as_str() {
        "register" | "registered" | "heartbeat" | "heartbeat_ack" | "error" => {
            serde_json::from_value(value).map_err(|e| CodecError::MalformedMessage(e.to_string()))
        }
        _ => Err(CodecError::UnknownMessageType(tag)),
    }
}
