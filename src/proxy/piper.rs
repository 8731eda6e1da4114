//! Dialed relay endpoints.
//!
//! A [`PiperDialer`] turns a target URI into a [`Piper`]: an outbound stream
//! that is either relayed against a caller's connection
//! ([`Piper::pipe_conn`]) or released early ([`Piper::close`]).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::proxy::relay::{relay, relay_response};
use crate::proxy::ws;
use crate::transport::BoxConn;

/// Placeholder in a router template replaced by the requested `host:port`.
pub const HOST_PLACEHOLDER: &str = "${HOST}";

/// An outbound stream ready to be relayed.
#[async_trait]
pub trait Piper: Send {
    /// Relay `conn` against the dialed stream until either side closes.
    async fn pipe_conn(self: Box<Self>, conn: BoxConn, target: &str) -> Result<()>;

    /// Relay one forwarded request on `conn`: the exchange ends when the
    /// dialed side finishes, and EOF from `conn` only half-closes it.
    async fn pipe_request(self: Box<Self>, conn: BoxConn, target: &str) -> Result<()> {
        self.pipe_conn(conn, target).await
    }

    /// Release the dialed stream without relaying.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens [`Piper`]s for target URIs.
#[async_trait]
pub trait PiperDialer: Send + Sync {
    /// Dial `uri`; the piper relays through buffers of `buffer_size` bytes.
    async fn dial_piper(&self, uri: &str, buffer_size: usize) -> Result<Box<dyn Piper>>;
}

#[async_trait]
impl<D: PiperDialer + ?Sized> PiperDialer for Arc<D> {
    async fn dial_piper(&self, uri: &str, buffer_size: usize) -> Result<Box<dyn Piper>> {
        (**self).dial_piper(uri, buffer_size).await
    }
}

/// [`Piper`] over an already connected stream.
pub struct StreamPiper {
    raw: BoxConn,
    buffer_size: usize,
}

impl StreamPiper {
    /// Wrap a dialed stream.
    pub fn new(raw: BoxConn, buffer_size: usize) -> Self {
        Self { raw, buffer_size }
    }
}

#[async_trait]
impl Piper for StreamPiper {
    async fn pipe_conn(self: Box<Self>, conn: BoxConn, target: &str) -> Result<()> {
        let stats = relay(conn, self.raw, self.buffer_size).await?;
        tracing::debug!(
            "pipe to {} done: {} bytes up, {} bytes down",
            target,
            stats.a_to_b,
            stats.b_to_a
        );
        Ok(())
    }

    async fn pipe_request(self: Box<Self>, conn: BoxConn, target: &str) -> Result<()> {
        let stats = relay_response(conn, self.raw, self.buffer_size).await?;
        tracing::debug!(
            "request to {} done: {} bytes up, {} bytes down",
            target,
            stats.a_to_b,
            stats.b_to_a
        );
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        drop(self.raw);
        Ok(())
    }
}

/// Network dialer for `tcp://host:port` and `ws://...` URIs.
///
/// A URI without a scheme is dialed as TCP. `ws://` URIs are dialed as
/// given, so they should already carry the `_uri` query the remote gateway
/// expects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetPiperDialer;

impl NetPiperDialer {
    /// Create a network dialer.
    pub fn new() -> Self {
        Self
    }

    /// Connect the raw stream for `uri`.
    pub async fn connect(&self, uri: &str) -> Result<BoxConn> {
        let (scheme, rest) = split_scheme(uri);
        match scheme {
            "tcp" => {
                let stream = TcpStream::connect(rest).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            "ws" => Ok(Box::new(ws::connect(uri).await?)),
            other => Err(Error::config(format!(
                "unsupported dial scheme {:?} in {}",
                other, uri
            ))),
        }
    }
}

#[async_trait]
impl PiperDialer for NetPiperDialer {
    async fn dial_piper(&self, uri: &str, buffer_size: usize) -> Result<Box<dyn Piper>> {
        let raw = self.connect(uri).await?;
        tracing::debug!("dialed {}", uri);
        Ok(Box::new(StreamPiper::new(raw, buffer_size)))
    }
}

/// Split `scheme://rest`; a URI without a scheme is `tcp`.
pub fn split_scheme(uri: &str) -> (&str, &str) {
    match uri.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("tcp", uri),
    }
}

/// Dialer that rewrites every target through a router template.
///
/// `${HOST}` in the router is replaced with the requested URI; a router
/// without the placeholder sends everything to the same place.
pub struct RouterPiperDialer {
    router: String,
    next: Arc<dyn PiperDialer>,
}

impl RouterPiperDialer {
    /// Route through `router`, delegating the rewritten URI to `next`.
    pub fn new(router: impl Into<String>, next: Arc<dyn PiperDialer>) -> Self {
        Self {
            router: router.into(),
            next,
        }
    }

    /// Router template.
    pub fn router(&self) -> &str {
        &self.router
    }

    /// Rewrite `uri` through the router template.
    pub fn route(&self, uri: &str) -> String {
        self.router.replace(HOST_PLACEHOLDER, uri)
    }
}

#[async_trait]
impl PiperDialer for RouterPiperDialer {
    async fn dial_piper(&self, uri: &str, buffer_size: usize) -> Result<Box<dyn Piper>> {
        let routed = self.route(uri);
        tracing::debug!("route {} -> {}", uri, routed);
        self.next.dial_piper(&routed, buffer_size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct RecordingDialer {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PiperDialer for RecordingDialer {
        async fn dial_piper(&self, uri: &str, _buffer_size: usize) -> Result<Box<dyn Piper>> {
            self.seen.lock().push(uri.to_string());
            Err(Error::status(0x05, "refused"))
        }
    }

    #[test]
    fn test_split_scheme() {
        assert_eq!(split_scheme("tcp://a:1"), ("tcp", "a:1"));
        assert_eq!(split_scheme("a:1"), ("tcp", "a:1"));
        assert_eq!(split_scheme("ws://gw/?_uri=x"), ("ws", "gw/?_uri=x"));
    }

    #[tokio::test]
    async fn test_router_substitutes_host() {
        let next = Arc::new(RecordingDialer {
            seen: Mutex::new(Vec::new()),
        });
        let router = RouterPiperDialer::new("tcp://${HOST}", next.clone());

        let err = router.dial_piper("example.com:80", 1024).await.err().unwrap();
        assert_eq!(err.status_code(), Some(0x05));
        assert_eq!(next.seen.lock().as_slice(), ["tcp://example.com:80"]);
    }

    #[tokio::test]
    async fn test_router_without_placeholder() {
        let next = Arc::new(RecordingDialer {
            seen: Mutex::new(Vec::new()),
        });
        let router = RouterPiperDialer::new("tcp://10.0.0.1:9", next.clone());
        let _ = router.dial_piper("example.com:80", 1024).await;
        assert_eq!(next.seen.lock().as_slice(), ["tcp://10.0.0.1:9"]);
    }

    #[tokio::test]
    async fn test_net_dialer_pipes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let piper = NetPiperDialer::new()
            .dial_piper(&format!("tcp://{}", addr), 1024)
            .await
            .unwrap();

        let (conn, mut peer) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move { piper.pipe_conn(Box::new(conn), "echo").await });

        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(peer);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_net_dialer_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let res = NetPiperDialer::new().dial_piper(&addr.to_string(), 1024).await;
        assert!(matches!(res, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let res = NetPiperDialer::new().dial_piper("udp://1.2.3.4:5", 1024).await;
        assert!(matches!(res, Err(Error::Config(_))));
    }
}
