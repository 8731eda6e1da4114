//! Connection with read-ahead bytes replayed before the live stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Stream that yields `having` before reading from `inner`.
///
/// Writes go straight to `inner`.
pub struct PrefixConn<S> {
    inner: S,
    having: Bytes,
}

impl<S> PrefixConn<S> {
    /// Wrap `inner`, replaying `having` on the first reads.
    pub fn new(inner: S, having: impl Into<Bytes>) -> Self {
        Self {
            inner,
            having: having.into(),
        }
    }

    /// Bytes not yet replayed.
    pub fn having(&self) -> &[u8] {
        &self.having
    }

    /// Decompose into the inner stream and the bytes not yet replayed.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.having)
    }
}

impl<S> AsyncRead for PrefixConn<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.having.is_empty() {
            let to_copy = this.having.len().min(buf.remaining());
            buf.put_slice(&this.having[..to_copy]);
            this.having.advance(to_copy);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for PrefixConn<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
