//! Connection gated until its protocol reply has been sent.
//!
//! A SOCKS5 server hands the client connection to its dialer before the
//! reply is written. The dialer may start relaying right away; the gate keeps
//! every read and write parked until the handler calls
//! [`PendingGate::start`], or fails them all after [`PendingGate::close`].
//!
//! The gate is a single-fire barrier: an atomic `pending` flag flipped from
//! 1 to 0 exactly once by compare-and-swap, followed by a wake-up of every
//! parked reader and writer. Both `start` and `close` may race; whichever
//! flips the flag first wins and the other is a no-op on the flag.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use futures::future::poll_fn;
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::transport::BoxConn;

const PENDING: u8 = 1;
const OPEN: u8 = 0;

struct Gate {
    pending: AtomicU8,
    closed: AtomicBool,
    readers: AtomicWaker,
    writers: AtomicWaker,
}

impl Gate {
    fn new() -> Self {
        Self {
            pending: AtomicU8::new(PENDING),
            closed: AtomicBool::new(false),
            readers: AtomicWaker::new(),
            writers: AtomicWaker::new(),
        }
    }

    fn open(&self) -> bool {
        let fired = self
            .pending
            .compare_exchange(PENDING, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if fired {
            self.readers.wake();
            self.writers.wake();
        }
        fired
    }

    fn is_open(&self) -> bool {
        self.pending.load(Ordering::Acquire) == OPEN
    }

    fn poll_open(&self, waker: &AtomicWaker, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.is_open() {
            waker.register(cx.waker());
            if !self.is_open() {
                return Poll::Pending;
            }
        }
        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "pending connection closed",
            )));
        }
        Poll::Ready(Ok(()))
    }
}

struct Shared {
    stream: Mutex<BoxConn>,
    having: Mutex<Bytes>,
    gate: Gate,
}

/// Shared handle to a gated connection.
///
/// Clones refer to the same connection and the same gate. The underlying
/// stream is closed when the last clone is dropped.
#[derive(Clone)]
pub struct PendingConn {
    shared: Arc<Shared>,
}

/// Control side of a [`PendingConn`]'s gate.
#[derive(Clone)]
pub struct PendingGate {
    shared: Arc<Shared>,
}

impl PendingConn {
    /// Gate `stream`; `having` holds bytes already read from it.
    pub fn new(stream: BoxConn, having: impl Into<Bytes>) -> Self {
        Self {
            shared: Arc::new(Shared {
                stream: Mutex::new(stream),
                having: Mutex::new(having.into()),
                gate: Gate::new(),
            }),
        }
    }

    /// Handle that opens or closes the gate.
    pub fn gate(&self) -> PendingGate {
        PendingGate {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Open the gate. Returns `false` if it was already open.
    pub fn start(&self) -> bool {
        self.gate().start()
    }

    /// Force the gate open and fail all further I/O.
    pub fn close(&self) -> bool {
        self.gate().close()
    }

    /// Whether the gate is still holding traffic.
    pub fn is_pending(&self) -> bool {
        !self.shared.gate.is_open()
    }

    /// Write `data` to the underlying stream regardless of the gate.
    ///
    /// Used by the owning handler to send its protocol reply before the
    /// relay is allowed to run.
    pub async fn write_direct(&self, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            let n = poll_fn(|cx| {
                let mut stream = self.shared.stream.lock();
                Pin::new(&mut *stream).poll_write(cx, &data[written..])
            })
            .await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += n;
        }
        poll_fn(|cx| {
            let mut stream = self.shared.stream.lock();
            Pin::new(&mut *stream).poll_flush(cx)
        })
        .await
    }
}

impl PendingGate {
    /// Release parked I/O. Only the first call has an effect.
    pub fn start(&self) -> bool {
        self.shared.gate.open()
    }

    /// Mark the connection closed and release parked I/O, which then fails.
    ///
    /// Returns `false` if the connection was already closed.
    pub fn close(&self) -> bool {
        let first = !self.shared.gate.closed.swap(true, Ordering::AcqRel);
        if !self.shared.gate.open() {
            // Already open: wake anything that raced the flag so it sees `closed`.
            self.shared.gate.readers.wake();
            self.shared.gate.writers.wake();
        }
        first
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.gate.closed.load(Ordering::Acquire)
    }
}

impl AsyncRead for PendingConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let shared = &self.shared;
        ready!(shared.gate.poll_open(&shared.gate.readers, cx))?;

        {
            let mut having = shared.having.lock();
            if !having.is_empty() {
                let to_copy = having.len().min(buf.remaining());
                buf.put_slice(&having[..to_copy]);
                having.advance(to_copy);
                return Poll::Ready(Ok(()));
            }
        }

        let mut stream = shared.stream.lock();
        Pin::new(&mut *stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PendingConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let shared = &self.shared;
        ready!(shared.gate.poll_open(&shared.gate.writers, cx))?;
        let mut stream = shared.stream.lock();
        Pin::new(&mut *stream).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let shared = &self.shared;
        ready!(shared.gate.poll_open(&shared.gate.writers, cx))?;
        let mut stream = shared.stream.lock();
        Pin::new(&mut *stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut stream = self.shared.stream.lock();
        Pin::new(&mut *stream).poll_shutdown(cx)
    }
}
