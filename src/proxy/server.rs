//! Ready-made distributors.
//!
//! [`Server::combined`] answers SOCKS5 and HTTP proxy clients on the same
//! port: SOCKS5 greetings start with `0x05`, HTTP requests with the first
//! letter of their method.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::log::Logger;
use crate::metrics::RelayMetrics;
use crate::proxy::http::{HttpServer, METHOD_BYTES};
use crate::proxy::mux::{Distributor, WILDCARD};
use crate::proxy::piper::PiperDialer;
use crate::proxy::socks5::{PiperSocksDialer, SocksServer, SOCKS_VERSION};
use crate::proxy::ws::WsServer;
use crate::transport::Listener;

/// Distributor with protocol handlers registered, plus its accept loops.
pub struct Server {
    dist: Arc<Distributor>,
    accept: Mutex<Vec<JoinHandle<()>>>,
    log: Logger,
}

impl Server {
    fn with_distributor(dist: Distributor, log: Logger) -> Self {
        Self {
            dist: Arc::new(dist),
            accept: Mutex::new(Vec::new()),
            log,
        }
    }

    /// SOCKS5 only.
    pub fn socks(
        dialer: Arc<dyn PiperDialer>,
        buffer_size: usize,
        log: Logger,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let dist = Distributor::with_metrics(log.named("mux"), metrics);
        dist.add_processor(SOCKS_VERSION, socks_processor(dialer, buffer_size, &log));
        Self::with_distributor(dist, log)
    }

    /// SOCKS5 and HTTP proxy on one port.
    pub fn combined(
        dialer: Arc<dyn PiperDialer>,
        buffer_size: usize,
        log: Logger,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let dist = Distributor::with_metrics(log.named("mux"), metrics);
        dist.add_processor(
            SOCKS_VERSION,
            socks_processor(Arc::clone(&dialer), buffer_size, &log),
        );
        let http = Arc::new(HttpServer::new(dialer, buffer_size, log.named("http")));
        for tag in METHOD_BYTES {
            dist.add_processor(tag, http.clone());
        }
        Self::with_distributor(dist, log)
    }

    /// WebSocket tunnel for every connection.
    pub fn ws(
        dialer: Arc<dyn PiperDialer>,
        buffer_size: usize,
        log: Logger,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let dist = Distributor::with_metrics(log.named("mux"), metrics);
        dist.add_processor(
            WILDCARD,
            Arc::new(WsServer::new(dialer, buffer_size, log.named("ws"))),
        );
        Self::with_distributor(dist, log)
    }

    /// Underlying distributor, for registering more processors.
    pub fn distributor(&self) -> &Arc<Distributor> {
        &self.dist
    }

    /// Bind `addr` and start accepting.
    pub async fn start(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener)
    }

    /// Start accepting from `listener`.
    pub fn serve<L: Listener>(&self, listener: L) -> Result<SocketAddr> {
        let local = listener.local_addr()?;
        let dist = Arc::clone(&self.dist);
        let log = self.log.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = dist.proc_accept(listener).await {
                log.warn(format_args!("listener {} stopped: {}", local, e));
            }
        });
        self.accept.lock().push(handle);
        self.log.info(format_args!("listening on {}", local));
        Ok(local)
    }

    /// Close every listener and connection.
    pub fn close(&self) {
        self.dist.close();
    }

    /// Close, then wait for the accept loops to exit.
    pub async fn shutdown(&self) {
        self.close();
        let handles: Vec<_> = self.accept.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn socks_processor(
    dialer: Arc<dyn PiperDialer>,
    buffer_size: usize,
    log: &Logger,
) -> Arc<SocksServer> {
    let socks_dialer = Arc::new(PiperSocksDialer::new(dialer, buffer_size));
    Arc::new(SocksServer::new(socks_dialer, log.named("socks5")).with_buffer_size(buffer_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::piper::NetPiperDialer;
    use crate::proxy::{http, socks5};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn combined() -> Server {
        Server::combined(
            Arc::new(NetPiperDialer::new()),
            4096,
            Logger::default(),
            Arc::new(RelayMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_combined_serves_both_protocols() {
        let echo = echo_server().await;
        let server = combined();
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let mut via_socks = socks5::dial(&addr.to_string(), &echo.to_string())
            .await
            .unwrap();
        via_socks.write_all(b"socks").await.unwrap();
        let mut buf = [0u8; 5];
        via_socks.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"socks");

        let mut via_http = http::dial(&addr.to_string(), &echo.to_string())
            .await
            .unwrap();
        via_http.write_all(b"https").await.unwrap();
        via_http.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"https");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_socks_only_rejects_http() {
        let server = Server::socks(
            Arc::new(NetPiperDialer::new()),
            4096,
            Logger::default(),
            Arc::new(RelayMetrics::new()),
        );
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let res = http::dial(&addr.to_string(), "127.0.0.1:1").await;
        assert!(res.is_err());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let server = combined();
        let addr = server.start("127.0.0.1:0").await.unwrap();
        server.shutdown().await;

        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
