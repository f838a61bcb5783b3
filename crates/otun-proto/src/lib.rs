//! Control protocol for the otun tunnel.
//!
//! The control channel (the first stream of every session) carries a
//! sequence of JSON messages separated by whitespace. This crate defines
//! the message variants and a streaming codec that splits adjacent JSON
//! values without any length-prefix framing.

use std::time::Duration;

mod codec;
mod messages;

pub use codec::{CodecError, ControlChannel};
pub use messages::ControlMessage;

/// How often the agent sends an application-level heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long the edge waits without a heartbeat before evicting a tunnel.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
