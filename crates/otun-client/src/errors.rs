//! Client error taxonomy and reconnect classification.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Errors surfaced by the tunnel client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client was shut down intentionally via the cancellation signal.
    #[error("client shutdown")]
    Shutdown,

    /// A failure that must not trigger reconnection.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The requested subdomain is already in use on the edge.
    #[error("subdomain already in use")]
    SubdomainTaken,

    /// The reconnect loop exhausted its retry budget.
    #[error("maximum reconnection attempts exceeded")]
    MaxRetriesExceeded,

    /// The edge rejected the registration token.
    #[error("registration rejected: {0}")]
    AuthRejected(String),

    /// Decode failure or closed control channel.
    #[error("protocol error: {0}")]
    Protocol(#[from] otun_proto::CodecError),

    /// The peer sent something other than the expected reply.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Session-layer failure.
    #[error("session error: {0}")]
    Mux(#[from] otun_mux::MuxError),

    /// Dial or raw I/O failure.
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ClientError {
    pub(crate) fn transport(context: impl Into<String>, source: io::Error) -> Self {
        ClientError::Transport {
            context: context.into(),
            source,
        }
    }
}

/// Returns true when the error must not trigger a reconnection attempt.
///
/// Walks the `source()` chain so wrapped sentinels classify the same as
/// bare ones, and recognises the edge's auth/collision message text for
/// errors that crossed the wire as plain strings.
pub fn is_permanent(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(client_err) = e.downcast_ref::<ClientError>() {
            match client_err {
                ClientError::Shutdown
                | ClientError::Permanent(_)
                | ClientError::SubdomainTaken
                | ClientError::MaxRetriesExceeded
                | ClientError::AuthRejected(_) => return true,
                _ => {}
            }
        }
        let text = e.to_string();
        if text.contains("already in use") || text.contains("invalid or missing API key") {
            return true;
        }
        current = e.source();
    }
    false
}

/// Returns true for errors the platform flags as plainly transient
/// (refused, reset, timed out and friends). Anything not permanent is
/// retried regardless; this only informs logging.
pub fn is_transient(err: &(dyn StdError + 'static)) -> bool {
    if is_permanent(err) {
        return false;
    }
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A wrapper error whose `source()` is the wrapped error, used to test
    /// classification through arbitrary nesting.
    #[derive(Debug)]
    struct Wrapped {
        inner: Box<dyn StdError + Send + Sync + 'static>,
    }

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "wrapped")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(self.inner.as_ref())
        }
    }

    fn wrap(err: impl StdError + Send + Sync + 'static) -> Wrapped {
        Wrapped {
            inner: Box::new(err),
        }
    }

    #[test]
    fn test_sentinels_are_permanent() {
        assert!(is_permanent(&ClientError::Shutdown));
        assert!(is_permanent(&ClientError::Permanent("nope".into())));
        assert!(is_permanent(&ClientError::SubdomainTaken));
        assert!(is_permanent(&ClientError::MaxRetriesExceeded));
        assert!(is_permanent(&ClientError::AuthRejected(
            "invalid or missing API key".into()
        )));
    }

    #[test]
    fn test_transport_errors_are_not_permanent() {
        let err = ClientError::transport(
            "failed to connect",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert!(!is_permanent(&err));
        assert!(is_transient(&err));
    }

    #[test]
    fn test_wrapping_preserves_classification() {
        let inner = ClientError::SubdomainTaken;
        let once = wrap(inner);
        assert!(is_permanent(&once));

        let twice = wrap(once);
        let thrice = wrap(twice);
        assert!(is_permanent(&thrice));

        let transient = wrap(wrap(ClientError::transport(
            "dial",
            io::Error::new(io::ErrorKind::TimedOut, "timeout"),
        )));
        assert!(!is_permanent(&transient));
        assert!(is_transient(&transient));
    }

    #[test]
    fn test_server_message_text_is_permanent() {
        let err = ClientError::Permanent("subdomain 'test' is already in use".into());
        assert!(is_permanent(&err));

        // Even as a bare formatted error from a different type.
        let io_err = io::Error::new(io::ErrorKind::Other, "invalid or missing API key");
        assert!(is_permanent(&io_err));
    }

    #[test]
    fn test_protocol_errors_are_retryable() {
        let err = ClientError::UnexpectedMessage("heartbeat".into());
        assert!(!is_permanent(&err));
    }
}
