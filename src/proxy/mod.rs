//! Protocol handlers and the byte-distribution multiplexer.
//!
//! Every handler implements [`Processor`]: it takes ownership of one inbound
//! connection, speaks its protocol's handshake, dials the target through a
//! [`PiperDialer`] and relays until either side closes.

pub mod http;
pub mod mux;
pub mod piper;
pub mod relay;
pub mod server;
pub mod socks5;
pub mod ws;

pub use mux::{ConnId, Distributor, WILDCARD};
pub use piper::{NetPiperDialer, Piper, PiperDialer, RouterPiperDialer, StreamPiper};
pub use relay::{relay, relay_response, RelayStats};
pub use server::Server;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::transport::BoxConn;

/// Handler for one inbound connection.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Handle `conn` to completion. Dropping the future closes it.
    async fn proc_conn(&self, conn: BoxConn) -> Result<()>;
}

#[async_trait]
impl<P: Processor + ?Sized> Processor for Arc<P> {
    async fn proc_conn(&self, conn: BoxConn) -> Result<()> {
        (**self).proc_conn(conn).await
    }
}
