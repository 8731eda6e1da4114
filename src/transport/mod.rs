//! Connection plumbing shared by every protocol handler.
//!
//! 1. **Connections**: [`BoxConn`] is the type-erased byte stream passed
//!    between the multiplexer, the handlers and the relay.
//!
//! 2. **Prefix reads**: [`PrefixConn`] re-delivers bytes that were read
//!    ahead (the multiplexer's one-byte peek, an HTTP head).
//!
//! 3. **Pending gate**: [`PendingConn`] withholds traffic on a connection
//!    until its protocol reply has been written.
//!
//! 4. **Framing**: [`FrameConn`] gives message boundaries over a raw stream.
//!
//! 5. **Idle timeout**: [`IdleConn`] / [`IdleListener`] decorate any
//!    connection or listener by composition.

mod frame;
mod idle;
mod pending;
mod prefix;

pub use frame::{
    encode_frame, frame_length, FrameConn, DEFAULT_FRAME_CAPACITY, HEADER_SIZE, MAX_FRAME_LENGTH,
};
pub use idle::{IdleConn, IdleListener};
pub use pending::{PendingConn, PendingGate};
pub use prefix::PrefixConn;

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

/// A bidirectional byte stream the gateway can own and relay.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Conn for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased connection. Dropping it closes it.
pub type BoxConn = Box<dyn Conn>;

/// Default relay buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Source of inbound connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next inbound connection.
    async fn accept(&self) -> io::Result<(BoxConn, SocketAddr)>;

    /// Local address the listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> io::Result<(BoxConn, SocketAddr)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

#[async_trait]
impl Listener for Box<dyn Listener> {
    async fn accept(&self) -> io::Result<(BoxConn, SocketAddr)> {
        (**self).accept().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}
