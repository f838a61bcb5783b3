//! Tunnel client: connect, register, serve streams, reconnect.

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use otun_mux::{MuxError, MuxSession, MuxStream};
use otun_proto::{ControlChannel, ControlMessage, HEARTBEAT_INTERVAL};

use crate::backoff::{Backoff, BackoffConfig};
use crate::errors::{is_permanent, is_transient, ClientError};

/// How long the heartbeat task waits for an ack before carrying on.
/// Acks are diagnostics; a late one is simply read next round.
const ACK_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Upper bound on bytes captured while looking for the first request line.
const MAX_CAPTURE: usize = 8 * 1024;

/// A successful registration as reported by the edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub url: String,
    pub subdomain: String,
}

/// The otun tunnel client.
///
/// Dials the edge, registers a tunnel and forwards every delivered stream
/// to a local service. With reconnection enabled, transient failures are
/// retried under exponential backoff while the server-assigned subdomain
/// is kept so the public URL survives reconnects.
pub struct Client {
    server_addr: String,
    local_addr: String,
    subdomain: Option<String>,
    token: Option<String>,
    backoff_config: BackoffConfig,
    reconnect: bool,

    /// Subdomain assigned by the edge on the last successful registration.
    assigned_subdomain: Option<String>,
    registration_tx: watch::Sender<Option<Registration>>,
}

impl Client {
    pub fn new(server_addr: impl Into<String>, local_addr: impl Into<String>) -> Self {
        let (registration_tx, _) = watch::channel(None);
        Self {
            server_addr: server_addr.into(),
            local_addr: local_addr.into(),
            subdomain: None,
            token: None,
            backoff_config: BackoffConfig::default(),
            reconnect: true,
            assigned_subdomain: None,
            registration_tx,
        }
    }

    /// Sets a preferred subdomain for the tunnel.
    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    /// Sets the API key for authentication.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the backoff configuration for reconnection.
    pub fn with_backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff_config = config;
        self
    }

    /// Enables or disables automatic reconnection.
    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    /// Sets the maximum number of reconnection attempts (0 = unlimited).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.backoff_config.max_retries = max_retries;
        self
    }

    /// Watches registrations. Holds `Some` while a tunnel is live and is
    /// reset to `None` at the start of every connection attempt.
    pub fn registration(&self) -> watch::Receiver<Option<Registration>> {
        self.registration_tx.subscribe()
    }

    /// Runs a single connection attempt until the session ends or the
    /// cancellation signal fires.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), ClientError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Shutdown),
            result = self.run_attempt(cancel) => result,
        }
    }

    async fn run_attempt(&mut self, cancel: &CancellationToken) -> Result<(), ClientError> {
        debug!(server = %self.server_addr, "connecting to server");
        let conn = TcpStream::connect(&self.server_addr).await.map_err(|e| {
            ClientError::transport(
                format!("failed to connect to server {}", self.server_addr),
                e,
            )
        })?;
        debug!(server = %self.server_addr, "tcp connection established");

        let session = MuxSession::client(conn);

        let control = session.open_stream()?;
        debug!(stream_id = control.id(), "control stream opened");
        let mut control = ControlChannel::new(control);

        // When reconnecting after a successful registration, ask for the
        // server-assigned subdomain so the public URL stays stable.
        let subdomain = self
            .assigned_subdomain
            .clone()
            .or_else(|| self.subdomain.clone());
        control
            .send(&ControlMessage::Register {
                subdomain,
                token: self.token.clone(),
            })
            .await?;

        match control.recv().await? {
            ControlMessage::Registered { url, subdomain } => {
                info!(url = %url, "Tunnel ready!");
                self.assigned_subdomain = Some(subdomain.clone());
                let _ = self
                    .registration_tx
                    .send(Some(Registration { url, subdomain }));
            }
            ControlMessage::Error { message } => {
                warn!(message = %message, "registration failed");
                session.close();
                return Err(classify_rejection(message));
            }
            other => {
                session.close();
                return Err(ClientError::UnexpectedMessage(other.tag().to_string()));
            }
        }

        let heartbeat = spawn_heartbeat(session.clone(), control, cancel.clone());

        info!(to = %self.local_addr, "Forwarding requests");

        let result = loop {
            match session.accept_stream().await {
                Some(stream) => {
                    debug!(stream_id = stream.id(), "accepted stream from server");
                    let local_addr = self.local_addr.clone();
                    tokio::spawn(handle_stream(stream, local_addr));
                }
                None => {
                    break if cancel.is_cancelled() {
                        Err(ClientError::Shutdown)
                    } else {
                        Err(ClientError::Mux(MuxError::SessionClosed))
                    };
                }
            }
        };

        heartbeat.abort();
        result
    }

    /// Runs the client, reconnecting on transient failures when enabled.
    pub async fn run_with_reconnect(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        if !self.reconnect {
            return self.run(&cancel).await;
        }

        let mut backoff = Backoff::new(self.backoff_config.clone());

        loop {
            // Cleared so a later failure can tell whether this attempt
            // registered successfully.
            let _ = self.registration_tx.send(None);

            let result = self.run(&cancel).await;

            if self.registration_tx.borrow().is_some() {
                backoff.reset();
            }

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if is_permanent(&err) {
                return Err(err);
            }

            if backoff.max_retries_reached() {
                error!("max reconnection attempts reached");
                return Err(ClientError::MaxRetriesExceeded);
            }

            let delay = backoff.next_delay();
            warn!(
                error = %err,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                transient = is_transient(&err),
                "connection lost, reconnecting"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Shutdown),
                _ = tokio::time::sleep(delay) => {}
            }

            info!(
                server = %self.server_addr,
                subdomain = ?self.assigned_subdomain,
                "attempting to reconnect"
            );
        }
    }
}

/// Maps a server rejection message onto the error taxonomy, preserving the
/// server's text where it matters.
fn classify_rejection(message: String) -> ClientError {
    if message.contains("invalid or missing API key") {
        ClientError::AuthRejected(message)
    } else if message.contains("already in use") {
        ClientError::SubdomainTaken
    } else {
        ClientError::Permanent(message)
    }
}

/// Sends a heartbeat every interval and closes the session when sending
/// fails or the cancellation signal fires. Acks are drained as
/// diagnostics; no state advances on them.
fn spawn_heartbeat(
    session: MuxSession,
    mut control: ControlChannel<MuxStream>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    session.close();
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = control.send(&ControlMessage::Heartbeat).await {
                debug!(error = %e, "heartbeat send failed, closing session");
                session.close();
                return;
            }
            trace!("heartbeat sent");

            match tokio::time::timeout(ACK_GRACE, control.recv()).await {
                Ok(Ok(ControlMessage::HeartbeatAck)) => trace!("heartbeat acknowledged"),
                Ok(Ok(msg)) => debug!(tag = msg.tag(), "unexpected control message"),
                Ok(Err(e)) => {
                    debug!(error = %e, "control channel closed");
                    session.close();
                    return;
                }
                Err(_) => {}
            }
        }
    })
}

/// Proxies one delivered stream to the local service.
async fn handle_stream(mut stream: MuxStream, local_addr: String) {
    let stream_id = stream.id();

    // Capture through the end of the first line so the request line can be
    // logged. Every byte captured here is replayed to the local service
    // before the raw splice takes over.
    let mut head = BytesMut::with_capacity(1024);
    loop {
        match stream.read_buf(&mut head).await {
            Ok(0) => break,
            Ok(_) => {
                if head.contains(&b'\n') || head.len() >= MAX_CAPTURE {
                    break;
                }
            }
            Err(e) => {
                debug!(stream_id, error = %e, "stream ended before request line");
                return;
            }
        }
    }

    if let Some((method, path)) = parse_request_line(&head) {
        info!(%method, %path, "Request");
    }

    let mut local = match TcpStream::connect(&local_addr).await {
        Ok(conn) => conn,
        Err(e) => {
            // Dropping the stream aborts it; the edge reports 502 upstream
            // behavior through the closed stream.
            error!(error = %e, local = %local_addr, "failed to connect to local service");
            return;
        }
    };
    debug!(stream_id, local = %local_addr, "connected to local service");

    if let Err(e) = local.write_all(&head).await {
        debug!(stream_id, error = %e, "failed to replay request head");
        return;
    }

    match otun_proxy::bidirectional(stream, local).await {
        Ok(()) => debug!(stream_id, "stream completed"),
        Err(e) => debug!(stream_id, error = %e, "stream completed"),
    }
}

/// Extracts method and path from `GET /path HTTP/1.1\r\n`.
fn parse_request_line(head: &[u8]) -> Option<(String, String)> {
    let line_end = head.iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&head[..line_end]).ok()?.trim();
    let mut parts = line.splitn(3, ' ');
    let method = parts.next()?;
    let path = parts.next()?;
    if method.is_empty() || path.is_empty() {
        return None;
    }
    Some((method.to_string(), path.to_string()))
}
