//! Length-prefixed framing over a byte stream.
//!
//! Wire format:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Tag (1) │ Length (3, BE) │ Payload (variable) │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The length is the 4-byte big-endian word at the start of the frame and
//! counts itself plus the payload. Its first byte doubles as a tag (zero or
//! random) and is masked off before the length is interpreted, so a frame is
//! at most `2^24 - 1` bytes.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::poll_fn;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{Error, Result};

/// Size of the length prefix.
pub const HEADER_SIZE: usize = 4;

/// Largest length the 3 usable prefix bytes can express.
pub const MAX_FRAME_LENGTH: usize = 0x00FF_FFFF;

/// Default per-frame buffer capacity.
pub const DEFAULT_FRAME_CAPACITY: usize = 64 * 1024;

/// Frame length from a prefix, with the tag byte masked to zero.
pub fn frame_length(header: &[u8; HEADER_SIZE]) -> usize {
    u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize
}

/// Encode `payload` as one frame with `tag` in the first prefix byte.
///
/// Fails with [`Error::FrameTooLarge`] when the frame would not fit the
/// 3-byte length.
pub fn encode_frame(payload: &[u8], tag: u8) -> Result<Bytes> {
    let length = HEADER_SIZE + payload.len();
    if length > MAX_FRAME_LENGTH {
        return Err(Error::FrameTooLarge {
            length,
            capacity: MAX_FRAME_LENGTH,
        });
    }
    let mut buf = BytesMut::with_capacity(length);
    put_frame(&mut buf, payload, tag);
    Ok(buf.freeze())
}

/// Callers keep `HEADER_SIZE + payload.len()` within `MAX_FRAME_LENGTH`.
fn put_frame(buf: &mut BytesMut, payload: &[u8], tag: u8) {
    let length = (HEADER_SIZE + payload.len()) as u32;
    buf.put_u8(tag);
    buf.put_slice(&length.to_be_bytes()[1..]);
    buf.put_slice(payload);
}

/// Framed view of a byte stream.
///
/// [`read_frame`](Self::read_frame) and [`write_frame`](Self::write_frame)
/// work on whole messages. The [`AsyncRead`] / [`AsyncWrite`] impls expose
/// the payloads as a plain byte stream again: every write becomes one frame
/// (split at capacity) and reads concatenate payloads, so a `FrameConn` can
/// be handed to a relay like any other connection.
pub struct FrameConn<S> {
    inner: S,
    capacity: usize,
    random_tag: bool,
    rbuf: BytesMut,
    scratch: Box<[u8]>,
    current: Bytes,
    wbuf: BytesMut,
}

impl<S> FrameConn<S> {
    /// Frame `inner` with the default capacity.
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, DEFAULT_FRAME_CAPACITY)
    }

    /// Frame `inner`; frames longer than `capacity` (prefix included) are
    /// rejected on read and never produced on write.
    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        let capacity = capacity.clamp(HEADER_SIZE + 1, MAX_FRAME_LENGTH);
        Self {
            inner,
            capacity,
            random_tag: false,
            rbuf: BytesMut::with_capacity(capacity),
            scratch: vec![0u8; capacity.min(16 * 1024)].into_boxed_slice(),
            current: Bytes::new(),
            wbuf: BytesMut::new(),
        }
    }

    /// Fill the tag byte of written frames with random values.
    pub fn random_tag(mut self, enabled: bool) -> Self {
        self.random_tag = enabled;
        self
    }

    /// Frame capacity, prefix included.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload a single frame can carry.
    pub fn max_payload(&self) -> usize {
        self.capacity - HEADER_SIZE
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Consume the framer, returning the underlying stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn next_tag(&self) -> u8 {
        if self.random_tag {
            rand::thread_rng().gen()
        } else {
            0
        }
    }
}

impl<S> FrameConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read the next frame's payload; `None` at a clean end of stream.
    pub async fn read_frame(&mut self) -> io::Result<Option<Bytes>> {
        if !self.current.is_empty() {
            return Ok(Some(std::mem::take(&mut self.current)));
        }
        poll_fn(|cx| self.poll_frame(cx)).await
    }

    /// Write `payload` as exactly one frame.
    pub async fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() > self.max_payload() {
            return Err(Error::FrameTooLarge {
                length: HEADER_SIZE + payload.len(),
                capacity: self.capacity,
            }
            .into());
        }
        poll_fn(|cx| self.poll_drain(cx)).await?;
        let tag = self.next_tag();
        put_frame(&mut self.wbuf, payload, tag);
        poll_fn(|cx| self.poll_drain(cx)).await?;
        self.inner.flush().await
    }

    fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<Bytes>>> {
        loop {
            if self.rbuf.len() >= HEADER_SIZE {
                let mut header = [0u8; HEADER_SIZE];
                header.copy_from_slice(&self.rbuf[..HEADER_SIZE]);
                let length = frame_length(&header);
                if length < HEADER_SIZE {
                    return Poll::Ready(Err(Error::protocol(format!(
                        "frame length {} shorter than its prefix",
                        length
                    ))
                    .into()));
                }
                if length > self.capacity {
                    return Poll::Ready(Err(Error::FrameTooLarge {
                        length,
                        capacity: self.capacity,
                    }
                    .into()));
                }
                if self.rbuf.len() >= length {
                    let mut frame = self.rbuf.split_to(length);
                    frame.advance(HEADER_SIZE);
                    return Poll::Ready(Ok(Some(frame.freeze())));
                }
            }

            let mut read = ReadBuf::new(&mut self.scratch);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read))?;
            let filled = read.filled();
            if filled.is_empty() {
                if self.rbuf.is_empty() {
                    return Poll::Ready(Ok(None));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame",
                )));
            }
            self.rbuf.extend_from_slice(filled);
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.wbuf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.wbuf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.wbuf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for FrameConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.current.is_empty() {
            match ready!(this.poll_frame(cx))? {
                Some(frame) => this.current = frame,
                None => return Poll::Ready(Ok(())),
            }
        }
        let to_copy = this.current.len().min(buf.remaining());
        buf.put_slice(&this.current[..to_copy]);
        this.current.advance(to_copy);
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for FrameConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        let n = data.len().min(this.max_payload());
        let tag = this.next_tag();
        put_frame(&mut this.wbuf, &data[..n], tag);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn header(frame: &[u8]) -> [u8; HEADER_SIZE] {
        frame[..HEADER_SIZE].try_into().unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let frame = encode_frame(b"abc", 0).unwrap();
        assert_eq!(frame.as_ref(), &[0, 0, 0, 7, b'a', b'b', b'c']);
        assert_eq!(frame_length(&header(&frame)), 7);
    }

    #[test]
    fn test_tag_masked_from_length() {
        let frame = encode_frame(b"abc", 0xAB).unwrap();
        assert_eq!(frame[0], 0xAB);
        assert_eq!(frame_length(&header(&frame)), 7);
        assert_eq!(frame_length(&[0xFF, 0xFF, 0xFF, 0xFF]), MAX_FRAME_LENGTH);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let largest = vec![0u8; MAX_FRAME_LENGTH - HEADER_SIZE];
        let frame = encode_frame(&largest, 0x11).unwrap();
        assert_eq!(frame_length(&header(&frame)), MAX_FRAME_LENGTH);

        let too_big = vec![0u8; MAX_FRAME_LENGTH - HEADER_SIZE + 1];
        let err = encode_frame(&too_big, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::FrameTooLarge {
                length,
                capacity: MAX_FRAME_LENGTH,
            } if length == MAX_FRAME_LENGTH + 1
        ));
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FrameConn::new(a).random_tag(true);
        let mut reader = FrameConn::new(b);

        writer.write_frame(b"hello").await.unwrap();
        writer.write_frame(b"").await.unwrap();
        writer.write_frame(b"world").await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(reader.read_frame().await.unwrap().unwrap().as_ref(), b"");
        assert_eq!(reader.read_frame().await.unwrap().unwrap().as_ref(), b"world");
    }

    #[tokio::test]
    async fn test_frame_split_across_writes() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let mut reader = FrameConn::new(b);

        let payload = vec![7u8; 300];
        let encoded = encode_frame(&payload, 0).unwrap();
        let task = tokio::spawn(async move {
            for chunk in encoded.chunks(7) {
                raw.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            raw
        });

        let got = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(got.as_ref(), payload.as_slice());
        drop(task.await.unwrap());
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_full_capacity() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut writer = FrameConn::with_capacity(a, 128);
        let mut reader = FrameConn::with_capacity(b, 128);

        let payload = vec![1u8; 124];
        writer.write_frame(&payload).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().unwrap().len(), 124);

        let err = writer.write_frame(&[0u8; 125]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let mut reader = FrameConn::with_capacity(b, 64);

        raw.write_all(&[0, 0, 1, 0]).await.unwrap();
        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_frame_shorter_than_prefix() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let mut reader = FrameConn::new(b);

        raw.write_all(&[0x55, 0, 0, 2]).await.unwrap();
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_eof_error() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let mut reader = FrameConn::new(b);

        raw.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(raw);
        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_stream_view() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut writer = FrameConn::with_capacity(a, 16);
        let mut reader = FrameConn::with_capacity(b, 16);

        // 40 bytes over 12-byte payload frames
        let data: Vec<u8> = (0..40u8).collect();
        writer.write_all(&data).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }
}
