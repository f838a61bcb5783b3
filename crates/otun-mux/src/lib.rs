//! Stream multiplexing over a single bytestream.
//!
//! A [`MuxSession`] carries any number of concurrent logical streams over
//! one underlying connection (typically TCP). Both sides may open streams;
//! each [`MuxStream`] is an ordered, independently flow-controlled byte
//! channel with half-close, usable anywhere a tokio `AsyncRead + AsyncWrite`
//! is expected. Session-level keepalive pings run independently of any
//! application traffic.

mod frame;
mod session;

pub use frame::{Frame, FrameFlags, FrameType, StreamId, INITIAL_WINDOW, MAX_FRAME_LEN};
pub use session::{MuxSession, MuxStream};

use thiserror::Error;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("session closed")]
    SessionClosed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
