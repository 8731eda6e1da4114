//! Bidirectional byte relay.
//!
//! Copies bytes between two connections until either direction finishes,
//! then closes both sides.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;

/// Byte counts moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from `a` to `b`
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`
    pub b_to_a: u64,
}

impl RelayStats {
    /// Total bytes in both directions.
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Relay `a` and `b` through buffers of `buffer_size` bytes.
///
/// Returns when either direction reaches EOF or fails; both connections are
/// dropped (closed) on return. An I/O error in the finishing direction is
/// returned, EOF is not.
pub async fn relay<A, B>(a: A, b: B, buffer_size: usize) -> Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let buffer_size = buffer_size.max(1);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let mut stats = RelayStats::default();

    tokio::select! {
        res = copy_half(a_read, b_write, buffer_size) => stats.a_to_b = res?,
        res = copy_half(b_read, a_write, buffer_size) => stats.b_to_a = res?,
    }

    tracing::trace!(
        "relay finished: {} bytes up, {} bytes down",
        stats.a_to_b,
        stats.b_to_a
    );
    Ok(stats)
}

/// Relay one request/response exchange between a client `a` and an origin `b`.
///
/// Unlike [`relay`], EOF from `a` only half-closes `b`; the exchange ends
/// when `b` finishes sending, so a client that shuts down its write side
/// after the request still receives the whole response.
pub async fn relay_response<A, B>(a: A, b: B, buffer_size: usize) -> Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let buffer_size = buffer_size.max(1);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let upload = copy_half(a_read, b_write, buffer_size);
    let download = copy_half(b_read, a_write, buffer_size);
    tokio::pin!(upload, download);

    let mut stats = RelayStats::default();
    let mut uploading = true;
    loop {
        tokio::select! {
            res = &mut upload, if uploading => {
                uploading = false;
                match res {
                    Ok(n) => stats.a_to_b = n,
                    Err(e) => tracing::trace!("request side ended: {}", e),
                }
            }
            res = &mut download => {
                stats.b_to_a = res?;
                break;
            }
        }
    }

    tracing::trace!(
        "exchange finished: {} bytes up, {} bytes down",
        stats.a_to_b,
        stats.b_to_a
    );
    Ok(stats)
}

/// Copy until EOF, flushing after every chunk so framed writers emit it.
async fn copy_half<R, W>(mut reader: R, mut writer: W, buffer_size: usize) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
    writer.shutdown().await.ok();
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);

        let task = tokio::spawn(relay(a, b, 16));

        a_peer.write_all(b"to b").await.unwrap();
        let mut buf = [0u8; 4];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to b");

        b_peer.write_all(b"to a").await.unwrap();
        a_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to a");

        drop(a_peer);
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 4);
    }

    #[tokio::test]
    async fn test_relay_response_survives_client_half_close() {
        let (client, client_peer) = tokio::io::duplex(1024);
        let (origin, mut origin_peer) = tokio::io::duplex(1024);
        let (mut client_read, mut client_write) = tokio::io::split(client_peer);

        let task = tokio::spawn(relay_response(client, origin, 1024));

        client_write.write_all(b"request").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut request = Vec::new();
        origin_peer.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        origin_peer.write_all(b"response").await.unwrap();
        drop(origin_peer);

        let mut response = Vec::new();
        client_read.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 7);
        assert_eq!(stats.b_to_a, 8);
    }

    #[tokio::test]
    async fn test_relay_closes_other_side() {
        let (a, a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);

        let task = tokio::spawn(relay(a, b, 1024));
        drop(a_peer);
        task.await.unwrap().unwrap();

        let mut out = Vec::new();
        b_peer.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }
}
