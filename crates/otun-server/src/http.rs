//! Minimal HTTP/1.1 head parsing and host-based routing helpers.
//!
//! The edge never interprets traffic beyond the request head: it reads
//! bytes off the raw connection until the headers are complete, extracts
//! `Host`, and preserves everything it read verbatim for replay into the
//! tunnel stream. From there the connection is a transparent byte splice.

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Cap on the size of a request head.
pub const MAX_HEAD_LEN: usize = 16 * 1024;

const MAX_HEADERS: usize = 100;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("connection closed before request head")]
    ConnectionClosed,

    #[error("request head exceeds {MAX_HEAD_LEN} bytes")]
    HeadTooLarge,

    #[error("malformed request: {0}")]
    Parse(httparse::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed request head plus every raw byte read so far.
///
/// `buffer` may extend past the end of the headers (the socket read can
/// pick up part of the body); all of it must be replayed downstream.
#[derive(Debug)]
pub struct RequestHead {
    pub buffer: BytesMut,
    pub method: String,
    pub path: String,
    pub host: Option<String>,
}

/// Reads from the connection until a full request head has arrived.
pub async fn read_request_head<S>(conn: &mut S) -> Result<RequestHead, HttpError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        let n = conn.read_buf(&mut buffer).await?;
        if n == 0 {
            return Err(HttpError::ConnectionClosed);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buffer) {
            Ok(httparse::Status::Complete(_)) => {
                let method = request.method.unwrap_or_default().to_string();
                let path = request.path.unwrap_or_default().to_string();
                let host = request
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("host"))
                    .map(|h| String::from_utf8_lossy(h.value).trim().to_string());
                return Ok(RequestHead {
                    buffer,
                    method,
                    path,
                    host,
                });
            }
            Ok(httparse::Status::Partial) => {
                if buffer.len() > MAX_HEAD_LEN {
                    return Err(HttpError::HeadTooLarge);
                }
            }
            Err(e) => return Err(HttpError::Parse(e)),
        }
    }
}

/// Extracts the routing subdomain from a `Host` header value.
///
/// The subdomain is the leftmost label when the host has at least two
/// labels; a bare host like `localhost:8080` has none. A single `:` is a
/// port suffix; more than one means a bare IPv6 literal, which is left
/// untouched (and yields no subdomain).
pub fn extract_subdomain(host: &str) -> Option<String> {
    let host = strip_port(host);

    let mut labels = host.split('.');
    let first = labels.next()?;
    labels.next()?;

    if first.is_empty() {
        return None;
    }
    Some(first.to_ascii_lowercase())
}

fn strip_port(host: &str) -> &str {
    if host.bytes().filter(|&b| b == b':').count() == 1 {
        match host.rfind(':') {
            Some(idx) => &host[..idx],
            None => host,
        }
    } else {
        host
    }
}

/// Validates a requested subdomain: 1-63 chars of lowercase alphanumerics
/// and hyphens, with no leading or trailing hyphen.
pub fn validate_subdomain(subdomain: &str) -> bool {
    (1..=63).contains(&subdomain.len())
        && subdomain
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
}

/// Writes a minimal plain-text response and flushes it.
pub async fn write_response<S>(
    conn: &mut S,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    conn.write_all(response.as_bytes()).await?;
    conn.flush().await
}

/// Writes a `301 Moved Permanently` to `location` and flushes it.
pub async fn write_redirect<S>(conn: &mut S, location: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    conn.write_all(response.as_bytes()).await?;
    conn.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_subdomain() {
        assert_eq!(
            extract_subdomain("abc123.tunnel.example.com"),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_subdomain("abc123.tunnel.example.com:8080"),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_subdomain("abc123.localhost"),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_subdomain("abc123.localhost:8080"),
            Some("abc123".to_string())
        );
        assert_eq!(extract_subdomain("MyApp.localhost"), Some("myapp".to_string()));
    }

    #[test]
    fn test_extract_subdomain_none() {
        assert_eq!(extract_subdomain("localhost"), None);
        assert_eq!(extract_subdomain("localhost:8080"), None);
        assert_eq!(extract_subdomain(""), None);
        assert_eq!(extract_subdomain(".example"), None);
        // Bare IPv6 literals carry no subdomain.
        assert_eq!(extract_subdomain("[::1]:8080"), None);
    }

    #[test]
    fn test_validate_subdomain() {
        assert!(validate_subdomain("abc"));
        assert!(validate_subdomain("my-app-01"));
        assert!(validate_subdomain("a"));
        assert!(validate_subdomain(&"x".repeat(63)));

        assert!(!validate_subdomain(""));
        assert!(!validate_subdomain(&"x".repeat(64)));
        assert!(!validate_subdomain("Upper"));
        assert!(!validate_subdomain("under_score"));
        assert!(!validate_subdomain("-leading"));
        assert!(!validate_subdomain("trailing-"));
        assert!(!validate_subdomain("dot.dot"));
    }

    #[tokio::test]
    async fn test_read_request_head() {
        let (mut writer, mut reader) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(
            &mut writer,
            b"GET /path HTTP/1.1\r\nHost: test.localhost:8080\r\nAccept: */*\r\n\r\n",
        )
        .await
        .unwrap();

        let head = read_request_head(&mut reader).await.unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/path");
        assert_eq!(head.host.as_deref(), Some("test.localhost:8080"));
        assert!(head.buffer.starts_with(b"GET /path HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_read_request_head_keeps_body_prefix() {
        let (mut writer, mut reader) = tokio::io::duplex(4096);
        let raw = b"POST /echo HTTP/1.1\r\nHost: x.localhost\r\nContent-Length: 4\r\n\r\nbody";
        tokio::io::AsyncWriteExt::write_all(&mut writer, raw)
            .await
            .unwrap();

        let head = read_request_head(&mut reader).await.unwrap();
        // Everything read so far is preserved, including body bytes.
        assert_eq!(&head.buffer[..], &raw[..]);
    }

    #[tokio::test]
    async fn test_read_request_head_split_arrival() {
        let (mut writer, mut reader) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            writer.write_all(b"GET / HTTP/1.1\r\nHo").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            writer.write_all(b"st: a.localhost\r\n\r\n").await.unwrap();
            writer
        });

        let head = read_request_head(&mut reader).await.unwrap();
        assert_eq!(head.host.as_deref(), Some("a.localhost"));
        drop(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_request_head_eof() {
        let (writer, mut reader) = tokio::io::duplex(4096);
        drop(writer);

        assert!(matches!(
            read_request_head(&mut reader).await,
            Err(HttpError::ConnectionClosed)
        ));
    }
}
