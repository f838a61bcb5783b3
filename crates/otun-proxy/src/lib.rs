//! Bidirectional data transfer between two byte-stream endpoints.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Copies data between two endpoints until both directions are done.
///
/// Each direction runs independently: when a copy observes end-of-stream
/// on its source it half-closes the destination's write side, signalling
/// EOF to the peer while leaving the opposite direction running. This is
/// what lets an HTTP client finish sending while the response is still
/// streaming back, and what WebSocket-style protocols need.
///
/// A write error in one direction does not cancel the other; the opposite
/// copy ends naturally when its peer closes. Both endpoints are dropped,
/// and therefore fully closed, when this returns.
///
/// Returns the first error that is not an end-of-stream condition, or
/// `Ok(())` if both directions completed cleanly.
pub async fn bidirectional<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let result = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
        if let Ok(n) = result {
            trace!(bytes = n, "copy a->b done");
        }
        result.err()
    };

    let b_to_a = async {
        let result = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        if let Ok(n) = result {
            trace!(bytes = n, "copy b->a done");
        }
        result.err()
    };

    let (err_ab, err_ba) = tokio::join!(a_to_b, b_to_a);

    match first_error([err_ab, err_ba]) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Returns the first error that is non-nil and not an end-of-stream
/// sentinel. `None` when every entry is nil or EOF, including empty input.
pub fn first_error<I>(errors: I) -> Option<io::Error>
where
    I: IntoIterator<Item = Option<io::Error>>,
{
    errors
        .into_iter()
        .flatten()
        .find(|e| e.kind() != io::ErrorKind::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use tokio::io::{duplex, AsyncReadExt};

    fn eof_error() -> io::Error {
        io::Error::new(io::ErrorKind::UnexpectedEof, "eof")
    }

    fn real_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "reset")
    }

    #[test]
    fn test_first_error_empty() {
        assert!(first_error([]).is_none());
    }

    #[test]
    fn test_first_error_all_clean() {
        assert!(first_error([None, None]).is_none());
        assert!(first_error([Some(eof_error()), None]).is_none());
        assert!(first_error([Some(eof_error()), Some(eof_error())]).is_none());
    }

    #[test]
    fn test_first_error_skips_eof() {
        let err = first_error([Some(eof_error()), Some(real_error())]).unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_first_error_returns_first_meaningful() {
        let first = io::Error::new(io::ErrorKind::BrokenPipe, "first");
        let err = first_error([None, Some(first), Some(real_error())]).unwrap();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    /// Splice transparency: bytes written into one end come out of the
    /// opposite end identical and in order, followed by EOF.
    #[tokio::test]
    async fn test_splice_transparency() {
        for &size in &[0usize, 1, 4096, 1024 * 1024] {
            let mut payload = vec![0u8; size];
            rand::thread_rng().fill_bytes(&mut payload);

            // left <-> splice <-> right
            let (mut left_outer, left_inner) = duplex(16 * 1024);
            let (mut right_outer, right_inner) = duplex(16 * 1024);

            let splice = tokio::spawn(bidirectional(left_inner, right_inner));

            let expected = payload.clone();
            let writer = tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                left_outer.write_all(&payload).await.unwrap();
                left_outer.shutdown().await.unwrap();
                left_outer
            });

            let mut received = Vec::new();
            right_outer.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, expected, "size {}", size);

            drop(right_outer);
            drop(writer.await.unwrap());
            splice.await.unwrap().unwrap();
        }
    }

    /// One side half-closing must not stop the opposite direction.
    #[tokio::test]
    async fn test_half_close_leaves_other_direction_open() {
        let (mut left_outer, left_inner) = duplex(4096);
        let (mut right_outer, right_inner) = duplex(4096);

        let splice = tokio::spawn(bidirectional(left_inner, right_inner));

        use tokio::io::AsyncWriteExt;
        left_outer.write_all(b"request").await.unwrap();
        left_outer.shutdown().await.unwrap();

        // Right observes the request then EOF.
        let mut request = Vec::new();
        right_outer.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        // The response direction still works after the half-close.
        right_outer.write_all(b"response").await.unwrap();
        right_outer.shutdown().await.unwrap();

        let mut response = Vec::new();
        left_outer.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        splice.await.unwrap().unwrap();
    }
}
