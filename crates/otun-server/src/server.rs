//! Edge server: listeners, agent acceptance and request routing.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use otun_mux::MuxSession;
use otun_proto::{ControlChannel, ControlMessage, HEARTBEAT_TIMEOUT};

use crate::http::{
    extract_subdomain, read_request_head, validate_subdomain, write_redirect, write_response,
};
use crate::registry::{Tunnel, TunnelRegistry};
use crate::tls::{self, CertificateResolver, DevCertResolver, PolicyResolver, TlsError};

/// Edge server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address agents dial into.
    pub control_addr: String,
    /// Public plaintext listener (ACME + redirect when TLS is enabled).
    pub http_addr: String,
    /// Public TLS listener; only bound when `domain` is set.
    pub https_addr: String,
    /// Base domain for tunnels. `None` runs plaintext-only.
    pub domain: Option<String>,
    /// Directory for cached certificates.
    pub cert_dir: PathBuf,
    /// Valid API keys; non-empty enables authentication.
    pub api_keys: Vec<String>,
    /// Tunnels without a heartbeat for this long are evicted.
    pub heartbeat_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_addr: ":4443".to_string(),
            http_addr: ":80".to_string(),
            https_addr: ":443".to_string(),
            domain: None,
            cert_dir: PathBuf::from("/var/lib/otun/certs"),
            api_keys: Vec::new(),
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// The otun edge server.
pub struct Server {
    config: ServerConfig,
    registry: Arc<TunnelRegistry>,
    control_listener: TcpListener,
    http_listener: TcpListener,
    https_listener: Option<TcpListener>,
}

impl Server {
    /// Binds every listener up front so configuration errors are fatal at
    /// startup rather than surfacing mid-run.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let control_listener = listen(&config.control_addr).await?;
        let http_listener = listen(&config.http_addr).await?;
        let https_listener = if config.domain.is_some() {
            let _ = rustls::crypto::ring::default_provider().install_default();
            Some(listen(&config.https_addr).await?)
        } else {
            None
        };

        Ok(Self {
            config,
            registry: Arc::new(TunnelRegistry::new()),
            control_listener,
            http_listener,
            https_listener,
        })
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control_listener.local_addr()
    }

    pub fn http_addr(&self) -> std::io::Result<SocketAddr> {
        self.http_listener.local_addr()
    }

    /// Runs until the cancellation signal fires, then closes every live
    /// session and waits for the listener loops to wind down.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        let Server {
            config,
            registry,
            control_listener,
            http_listener,
            https_listener,
        } = self;

        let config = Arc::new(config);
        let http_suffix = format!(":{}", http_listener.local_addr()?.port());

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        info!(addr = %control_listener.local_addr()?, "control listener started");
        tasks.push(tokio::spawn(control_accept_loop(
            control_listener,
            registry.clone(),
            config.clone(),
            http_suffix,
            cancel.clone(),
        )));

        tasks.push(tokio::spawn(sweeper_loop(
            registry.clone(),
            config.heartbeat_timeout,
            cancel.clone(),
        )));

        match https_listener {
            Some(listener) => {
                let provider: Arc<dyn CertificateResolver> =
                    Arc::new(DevCertResolver::new(config.cert_dir.clone()));
                let policy = Arc::new(PolicyResolver::new(registry.clone(), provider.clone()));
                let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(policy)));

                info!(
                    addr = %listener.local_addr()?,
                    domain = config.domain.as_deref().unwrap_or_default(),
                    "https listener started"
                );
                tasks.push(tokio::spawn(https_loop(
                    listener,
                    acceptor,
                    registry.clone(),
                    cancel.clone(),
                )));

                info!(
                    addr = %http_listener.local_addr()?,
                    "http listener started (ACME challenges + redirect)"
                );
                tasks.push(tokio::spawn(redirect_loop(
                    http_listener,
                    provider,
                    cancel.clone(),
                )));
            }
            None => {
                info!(
                    addr = %http_listener.local_addr()?,
                    "running in HTTP-only mode (no TLS)"
                );
                tasks.push(tokio::spawn(public_loop(
                    http_listener,
                    registry.clone(),
                    cancel.clone(),
                )));
            }
        }

        cancel.cancelled().await;
        registry.close_all();
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

/// Binds a TCP listener, accepting the `:port` shorthand.
async fn listen(addr: &str) -> Result<TcpListener, ServerError> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::Bind { addr, source: e })
}

/// Accepts agent control connections.
async fn control_accept_loop(
    listener: TcpListener,
    registry: Arc<TunnelRegistry>,
    config: Arc<ServerConfig>,
    http_suffix: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    let registry = registry.clone();
                    let config = config.clone();
                    let http_suffix = http_suffix.clone();
                    tokio::spawn(handle_agent(conn, peer, registry, config, http_suffix));
                }
                Err(e) => {
                    error!(error = %e, "failed to accept tunnel client");
                }
            }
        }
    }
}

/// Serves one agent connection: session, registration handshake, control
/// loop, removal.
async fn handle_agent(
    conn: TcpStream,
    peer: SocketAddr,
    registry: Arc<TunnelRegistry>,
    config: Arc<ServerConfig>,
    http_suffix: String,
) {
    info!(remote_addr = %peer, "tunnel client connected");

    let session = MuxSession::server(conn);

    // The agent opens the first stream as its control channel.
    let control = match session.accept_stream().await {
        Some(stream) => stream,
        None => {
            debug!(remote_addr = %peer, "session closed before control stream");
            return;
        }
    };
    info!(remote_addr = %peer, stream_id = control.id(), "control stream accepted");
    let mut control = ControlChannel::new(control);

    let msg = match control.recv().await {
        Ok(msg) => msg,
        Err(e) => {
            error!(remote_addr = %peer, error = %e, "failed to read register message");
            let _ = send_error(&mut control, "failed to read register message").await;
            session.close();
            return;
        }
    };

    let (requested, token) = match msg {
        ControlMessage::Register { subdomain, token } => (subdomain, token),
        other => {
            error!(remote_addr = %peer, got = other.tag(), "expected register message");
            let _ = send_error(&mut control, "expected register message").await;
            session.close();
            return;
        }
    };

    // Authentication: byte-exact match against the configured keys.
    let auth_principal = if config.api_keys.is_empty() {
        None
    } else {
        match token.filter(|t| config.api_keys.iter().any(|k| k == t)) {
            Some(token) => Some(token),
            None => {
                warn!(remote_addr = %peer, "rejected registration with bad API key");
                let _ = send_error(&mut control, "invalid or missing API key").await;
                session.close();
                return;
            }
        }
    };

    let subdomain = match requested.filter(|s| !s.is_empty()) {
        Some(requested) => {
            if !validate_subdomain(&requested) {
                warn!(remote_addr = %peer, subdomain = %requested, "invalid subdomain requested");
                let _ = send_error(
                    &mut control,
                    &format!("invalid subdomain '{requested}'"),
                )
                .await;
                session.close();
                return;
            }
            requested
        }
        None => generate_subdomain(),
    };

    // Check-and-insert is one critical section; a concurrent agent racing
    // for the same name loses here.
    let tunnel = match registry.register(Tunnel::new(
        subdomain.clone(),
        session.clone(),
        auth_principal,
    )) {
        Ok(tunnel) => tunnel,
        Err(e) => {
            warn!(remote_addr = %peer, subdomain = %subdomain, "subdomain already in use");
            let _ = send_error(&mut control, &e.to_string()).await;
            session.close();
            return;
        }
    };

    info!(subdomain = %subdomain, remote_addr = %peer, "tunnel registered");

    let url = public_url(&config, &http_suffix, &subdomain);
    if let Err(e) = control
        .send(&ControlMessage::Registered {
            url,
            subdomain: subdomain.clone(),
        })
        .await
    {
        error!(subdomain = %subdomain, error = %e, "failed to send registered message");
        registry.remove(&subdomain);
        session.close();
        return;
    }

    // Control loop: heartbeats refresh liveness, anything else is logged
    // and skipped, a read error tears the tunnel down.
    loop {
        match control.recv().await {
            Ok(ControlMessage::Heartbeat) => {
                tunnel.touch();
                debug!(subdomain = %subdomain, "heartbeat received");
                if let Err(e) = control.send(&ControlMessage::HeartbeatAck).await {
                    error!(subdomain = %subdomain, error = %e, "failed to send heartbeat ack");
                    break;
                }
            }
            Ok(other) => {
                warn!(subdomain = %subdomain, tag = other.tag(), "unexpected control message");
            }
            Err(e) => {
                info!(subdomain = %subdomain, error = %e, "control stream closed");
                break;
            }
        }
    }

    registry.remove(&subdomain);
    session.close();
}

async fn send_error(
    control: &mut ControlChannel<otun_mux::MuxStream>,
    message: &str,
) -> Result<(), otun_proto::CodecError> {
    control
        .send(&ControlMessage::Error {
            message: message.to_string(),
        })
        .await
}

fn public_url(config: &ServerConfig, http_suffix: &str, subdomain: &str) -> String {
    match &config.domain {
        Some(domain) => format!("https://{subdomain}.{domain}"),
        None => format!("http://{subdomain}.localhost{http_suffix}"),
    }
}

/// Generates a fresh 8-hex-char subdomain from a cryptographically strong
/// source.
fn generate_subdomain() -> String {
    let bytes: [u8; 4] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Plaintext public listener (HTTP-only mode).
async fn public_loop(listener: TcpListener, registry: Arc<TunnelRegistry>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    let registry = registry.clone();
                    tokio::spawn(handle_public_conn(conn, peer, registry));
                }
                Err(e) => {
                    error!(error = %e, "public listener accept error");
                }
            }
        }
    }
}

/// TLS public listener.
async fn https_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<TunnelRegistry>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    let acceptor = acceptor.clone();
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(conn).await {
                            Ok(tls_conn) => handle_public_conn(tls_conn, peer, registry).await,
                            Err(e) => debug!(remote_addr = %peer, error = %e, "tls handshake failed"),
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "https listener accept error");
                }
            }
        }
    }
}

/// Routes one public connection: extract the subdomain from `Host`, open a
/// fresh stream on the owning session, replay the captured bytes and
/// splice. The connection is a transparent byte proxy from here on.
async fn handle_public_conn<S>(mut conn: S, peer: SocketAddr, registry: Arc<TunnelRegistry>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let head = match read_request_head(&mut conn).await {
        Ok(head) => head,
        Err(e) => {
            debug!(remote_addr = %peer, error = %e, "failed to read request head");
            return;
        }
    };

    let subdomain = match head.host.as_deref().and_then(extract_subdomain) {
        Some(subdomain) => subdomain,
        None => {
            warn!(remote_addr = %peer, host = head.host.as_deref().unwrap_or_default(), "no subdomain in request");
            let _ = write_response(&mut conn, 400, "Bad Request", "No subdomain specified\n").await;
            return;
        }
    };

    let tunnel = match registry.lookup(&subdomain) {
        Some(tunnel) => tunnel,
        None => {
            warn!(remote_addr = %peer, subdomain = %subdomain, "no tunnel found for subdomain");
            let _ = write_response(
                &mut conn,
                404,
                "Not Found",
                &format!("No tunnel found for subdomain: {subdomain}\n"),
            )
            .await;
            return;
        }
    };

    let mut stream = match tunnel.session.open_stream() {
        Ok(stream) => stream,
        Err(e) => {
            error!(subdomain = %subdomain, error = %e, "failed to open stream");
            let _ = write_response(&mut conn, 502, "Bad Gateway", "Failed to connect to tunnel\n")
                .await;
            return;
        }
    };

    info!(
        subdomain = %subdomain,
        method = %head.method,
        path = %head.path,
        stream_id = stream.id(),
        remote_addr = %peer,
        "routing to tunnel"
    );

    // Replay the request head (and any body bytes already read) verbatim,
    // then hand both ends to the splice.
    if let Err(e) = stream.write_all(&head.buffer).await {
        error!(subdomain = %subdomain, error = %e, "failed to write request to tunnel");
        return;
    }

    match otun_proxy::bidirectional(conn, stream).await {
        Ok(()) => debug!(subdomain = %subdomain, "proxy completed"),
        Err(e) => debug!(subdomain = %subdomain, error = %e, "proxy completed"),
    }
}

/// Plaintext listener in TLS mode: answers ACME HTTP-01 challenges via the
/// certificate provider and redirects everything else to HTTPS.
async fn redirect_loop(
    listener: TcpListener,
    provider: Arc<dyn CertificateResolver>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    let provider = provider.clone();
                    tokio::spawn(handle_redirect_conn(conn, peer, provider));
                }
                Err(e) => {
                    error!(error = %e, "http listener accept error");
                }
            }
        }
    }
}

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

async fn handle_redirect_conn(
    mut conn: TcpStream,
    peer: SocketAddr,
    provider: Arc<dyn CertificateResolver>,
) {
    let head = match read_request_head(&mut conn).await {
        Ok(head) => head,
        Err(e) => {
            debug!(remote_addr = %peer, error = %e, "failed to read request head");
            return;
        }
    };

    if let Some(token) = head.path.strip_prefix(ACME_CHALLENGE_PREFIX) {
        match provider.challenge_response(token) {
            Some(key_authorization) => {
                debug!(remote_addr = %peer, "served ACME challenge");
                let _ = write_response(&mut conn, 200, "OK", &key_authorization).await;
            }
            None => {
                let _ = write_response(&mut conn, 404, "Not Found", "unknown challenge\n").await;
            }
        }
        return;
    }

    match head.host {
        Some(host) => {
            let target = format!("https://{host}{}", head.path);
            let _ = write_redirect(&mut conn, &target).await;
        }
        None => {
            let _ = write_response(&mut conn, 400, "Bad Request", "missing Host header\n").await;
        }
    }
}

/// Evicts tunnels whose heartbeat went stale. Runs at a third of the
/// timeout so an expired tunnel is caught promptly.
async fn sweeper_loop(registry: Arc<TunnelRegistry>, timeout: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(timeout / 3);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let evicted = registry.evict_stale(timeout);
                if evicted > 0 {
                    info!(evicted, "evicted stale tunnels");
                }
            }
        }
    }
}
