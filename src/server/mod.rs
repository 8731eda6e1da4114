//! Forward lifecycle management.
//!
//! A [`Forward`] runs any number of named listeners side by side:
//!
//! ```text
//!   socks://host:port  ──► Distributor { 0x05 → SOCKS5 }          ─┐
//!   proxy://host:port  ──► Distributor { 0x05 → SOCKS5, C/G/P/.. → HTTP }
//!   ws://host:port     ──► Distributor { '*' → WebSocket tunnel }  ├─► RouterPiperDialer(router) ─► base dialer
//!   tcp://host:port    ──► accept loop, every connection ─────────┘      (router used as-is)
//!
//! `tcp4://` and `tcp6://` are accepted as spellings of `tcp://`; any other
//! scheme is rejected before anything is bound.
//! ```
//!
//! Names are unique while active. Stopping a forward closes its listener;
//! relays already running are left to finish on their own.

pub mod config;

pub use config::{ForwardConfig, GatewayConfig, GatewayConfigFile};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::log::Logger;
use crate::metrics::RelayMetrics;
use crate::proxy::mux::ConnId;
use crate::proxy::piper::{PiperDialer, RouterPiperDialer};
use crate::proxy::server::Server;
use crate::transport::{BoxConn, IdleListener, Listener, DEFAULT_BUFFER_SIZE};

/// Public view of a running forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardInfo {
    /// Forward name
    pub name: String,
    /// Listen URL scheme
    pub scheme: String,
    /// Listen URL as given
    pub listen: String,
    /// Router template
    pub router: String,
    /// Bound address
    pub local_addr: SocketAddr,
}

enum Closer {
    Server(Arc<Server>),
    Raw {
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
}

struct ForwardEntry {
    id: ConnId,
    info: ForwardInfo,
    closer: Closer,
}

impl ForwardEntry {
    fn close(self) {
        match self.closer {
            Closer::Server(server) => server.close(),
            // Dropping `stop` ends the accept loop; the task detaches.
            Closer::Raw { stop, .. } => drop(stop),
        }
    }
}

struct Inner {
    entries: Mutex<HashMap<String, ForwardEntry>>,
    dialer: Arc<dyn PiperDialer>,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
    next_id: AtomicU64,
    log: Logger,
    metrics: Arc<RelayMetrics>,
}

/// Named listener manager.
#[derive(Clone)]
pub struct Forward {
    inner: Arc<Inner>,
}

impl Forward {
    /// Create a manager dialing through `dialer`.
    pub fn new(dialer: Arc<dyn PiperDialer>, log: Logger) -> Self {
        Self::build(dialer, DEFAULT_BUFFER_SIZE, None, log)
    }

    /// Create a manager with the buffer size and idle timeout of `config`.
    pub fn from_config(config: &GatewayConfig, dialer: Arc<dyn PiperDialer>, log: Logger) -> Self {
        log.set_level(config.log_level);
        Self::build(dialer, config.buffer_size, config.idle_timeout, log)
    }

    fn build(
        dialer: Arc<dyn PiperDialer>,
        buffer_size: usize,
        idle_timeout: Option<Duration>,
        log: Logger,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                dialer,
                buffer_size,
                idle_timeout,
                next_id: AtomicU64::new(1),
                log,
                metrics: Arc::new(RelayMetrics::new()),
            }),
        }
    }

    /// Metrics shared by every forward of this manager.
    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.inner.metrics
    }

    /// Start every forward in `config`, stopping the ones already started
    /// if any fails.
    pub async fn start_all(&self, config: &GatewayConfig) -> Result<Vec<SocketAddr>> {
        let mut addrs = Vec::with_capacity(config.forwards.len());
        for forward in &config.forwards {
            match self
                .start_forward(&forward.name, &forward.listen, &forward.router)
                .await
            {
                Ok(addr) => addrs.push(addr),
                Err(e) => {
                    self.stop().await;
                    return Err(e);
                }
            }
        }
        Ok(addrs)
    }

    /// Start a forward named `name` listening on `listen_url` and routing
    /// through `router`. Returns the bound address.
    pub async fn start_forward(&self, name: &str, listen_url: &str, router: &str) -> Result<SocketAddr> {
        let inner = &self.inner;
        if name.is_empty() {
            return Err(Error::config("forward name cannot be empty"));
        }
        if inner.entries.lock().contains_key(name) {
            return Err(Error::DuplicateForward(name.to_string()));
        }
        let (scheme, addr) = config::listen_addr(listen_url).map_err(Error::Config)?;

        let tcp = TcpListener::bind(&addr).await?;
        let listener: Box<dyn Listener> = match inner.idle_timeout {
            Some(timeout) => Box::new(IdleListener::new(tcp, timeout)),
            None => Box::new(tcp),
        };
        let local_addr = listener.local_addr()?;
        let log = inner.log.named(name);

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let info = ForwardInfo {
            name: name.to_string(),
            scheme: scheme.clone(),
            listen: listen_url.to_string(),
            router: router.to_string(),
            local_addr,
        };

        let mut entries = inner.entries.lock();
        // The name may have been taken while binding.
        if entries.contains_key(name) {
            return Err(Error::DuplicateForward(name.to_string()));
        }

        let closer = match scheme.as_str() {
            "socks" | "proxy" | "ws" => {
                let routed: Arc<dyn PiperDialer> =
                    Arc::new(RouterPiperDialer::new(router, Arc::clone(&inner.dialer)));
                let metrics = Arc::clone(&inner.metrics);
                let server = match scheme.as_str() {
                    "socks" => Server::socks(routed, inner.buffer_size, log, metrics),
                    "proxy" => Server::combined(routed, inner.buffer_size, log, metrics),
                    _ => Server::ws(routed, inner.buffer_size, log, metrics),
                };
                server.serve(listener)?;
                Closer::Server(Arc::new(server))
            }
            "tcp" | "tcp4" | "tcp6" => {
                let (stop, stop_rx) = oneshot::channel();
                let task = tokio::spawn(run_raw(
                    Arc::clone(inner),
                    name.to_string(),
                    id,
                    listener,
                    router.to_string(),
                    stop_rx,
                    log,
                ));
                Closer::Raw { stop, task }
            }
            other => {
                return Err(Error::config(format!("unsupported listen scheme {:?}", other)));
            }
        };

        entries.insert(name.to_string(), ForwardEntry { id, info, closer });
        drop(entries);

        inner.log.info(format_args!(
            "forward {} started: {} -> {}",
            name, local_addr, router
        ));
        Ok(local_addr)
    }

    /// Stop the forward named `name`.
    pub fn stop_forward(&self, name: &str) -> Result<()> {
        let entry = self
            .inner
            .entries
            .lock()
            .remove(name)
            .ok_or_else(|| Error::ForwardNotFound(name.to_string()))?;
        let addr = entry.info.local_addr;
        entry.close();
        self.inner
            .log
            .info(format_args!("forward {} stopped ({})", name, addr));
        Ok(())
    }

    /// Stop every forward and wait for their accept loops to exit.
    pub async fn stop(&self) {
        let entries: Vec<_> = self.inner.entries.lock().drain().collect();
        for (name, entry) in entries {
            match entry.closer {
                Closer::Server(server) => server.shutdown().await,
                Closer::Raw { stop, task } => {
                    drop(stop);
                    let _ = task.await;
                }
            }
            self.inner.log.debug(format_args!("forward {} stopped", name));
        }
    }

    /// Running forwards, sorted by name.
    pub fn forwards(&self) -> Vec<ForwardInfo> {
        let mut list: Vec<_> = self
            .inner
            .entries
            .lock()
            .values()
            .map(|e| e.info.clone())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Bound address of the forward named `name`.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.inner
            .entries
            .lock()
            .get(name)
            .map(|e| e.info.local_addr)
    }

    /// Whether a forward named `name` is running.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.entries.lock().contains_key(name)
    }
}

/// Plain accept loop: every connection is piped to `router` itself.
async fn run_raw(
    inner: Arc<Inner>,
    name: String,
    id: ConnId,
    listener: Box<dyn Listener>,
    router: String,
    mut stop: oneshot::Receiver<()>,
    log: Logger,
) {
    loop {
        let accepted = tokio::select! {
            _ = &mut stop => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((conn, peer)) => {
                let inner = Arc::clone(&inner);
                let router = router.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    inner.metrics.increment_connections();
                    let res = AssertUnwindSafe(pipe_raw(&inner, conn, &router))
                        .catch_unwind()
                        .await;
                    inner.metrics.decrement_connections();
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            inner.metrics.increment_failed();
                            log.debug(format_args!("{} -> {} ended: {}", peer, router, e));
                        }
                        Err(_) => {
                            inner.metrics.increment_panics();
                            log.error(format_args!("relay for {} panicked", peer));
                        }
                    }
                });
            }
            Err(e) => {
                log.warn(format_args!("accept failed: {}", e));
                break;
            }
        }
    }

    let mut entries = inner.entries.lock();
    if entries.get(&name).map(|e| e.id) == Some(id) {
        entries.remove(&name);
    }
}

async fn pipe_raw(inner: &Inner, conn: BoxConn, router: &str) -> Result<()> {
    // A failed dial drops (closes) the accepted connection.
    let piper = inner.dialer.dial_piper(router, inner.buffer_size).await?;
    piper.pipe_conn(conn, router).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::piper::NetPiperDialer;
    use crate::proxy::{socks5, ws};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
    use tokio::net::TcpStream;

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

    fn forward() -> Forward {
        Forward::new(Arc::new(NetPiperDialer::new()), Logger::default())
    }

    async fn ping<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) {
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_tcp_forward_echo() {
        let echo = echo_server().await;
        let fwd = forward();
        let addr = fwd
            .start_forward("t", "tcp://127.0.0.1:0", &format!("tcp://{}", echo))
            .await
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        ping(&mut stream).await;
        fwd.stop().await;
    }

    #[tokio::test]
    async fn test_socks_forward_routes_host() {
        let echo = echo_server().await;
        let fwd = forward();
        let addr = fwd
            .start_forward("s", "socks://127.0.0.1:0", "tcp://${HOST}")
            .await
            .unwrap();

        let mut stream = socks5::dial(&addr.to_string(), &echo.to_string())
            .await
            .unwrap();
        ping(&mut stream).await;
        fwd.stop().await;
    }

    #[tokio::test]
    async fn test_ws_forward() {
        let echo = echo_server().await;
        let fwd = forward();
        let addr = fwd
            .start_forward("w", "ws://127.0.0.1:0", "tcp://${HOST}")
            .await
            .unwrap();

        let mut stream = ws::dial(&format!("ws://{}/", addr), &echo.to_string())
            .await
            .unwrap();
        ping(&mut stream).await;
        fwd.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_name() {
        let fwd = forward();
        let first = fwd
            .start_forward("dup", "socks://127.0.0.1:0", "tcp://${HOST}")
            .await
            .unwrap();

        let err = fwd
            .start_forward("dup", "tcp://127.0.0.1:0", "tcp://127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateForward(ref n) if n == "dup"));
        assert_eq!(fwd.forwards().len(), 1);
        assert_eq!(fwd.local_addr("dup"), Some(first));
        assert_eq!(fwd.forwards()[0].scheme, "socks");

        let err = fwd
            .start_forward("", "tcp://127.0.0.1:0", "tcp://127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        fwd.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_listen_scheme_rejected() {
        let fwd = forward();
        for listen in ["udp://127.0.0.1:0", "unix://localhost:0"] {
            let err = fwd
                .start_forward("u", listen, "tcp://127.0.0.1:1")
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Config(ref m) if m.contains("unsupported")));
        }
        assert!(!fwd.contains("u"));
        assert!(fwd.forwards().is_empty());
    }

    #[tokio::test]
    async fn test_stop_forward() {
        let fwd = forward();
        let addr = fwd
            .start_forward("a", "tcp://127.0.0.1:0", "tcp://127.0.0.1:1")
            .await
            .unwrap();
        fwd.start_forward("b", "proxy://127.0.0.1:0", "tcp://${HOST}")
            .await
            .unwrap();

        fwd.stop_forward("a").unwrap();
        assert!(!fwd.contains("a"));
        assert!(fwd.contains("b"));
        assert!(matches!(
            fwd.stop_forward("a"),
            Err(Error::ForwardNotFound(_))
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());

        // the name is free again
        fwd.start_forward("a", "tcp://127.0.0.1:0", "tcp://127.0.0.1:1")
            .await
            .unwrap();
        fwd.stop().await;
    }

    #[tokio::test]
    async fn test_stop_all() {
        let fwd = forward();
        let a = fwd
            .start_forward("a", "tcp://127.0.0.1:0", "tcp://127.0.0.1:1")
            .await
            .unwrap();
        let b = fwd
            .start_forward("b", "socks://127.0.0.1:0", "tcp://${HOST}")
            .await
            .unwrap();

        fwd.stop().await;
        assert!(fwd.forwards().is_empty());
        assert!(TcpStream::connect(a).await.is_err());
        assert!(TcpStream::connect(b).await.is_err());
    }

    #[tokio::test]
    async fn test_raw_dial_failure_closes_conn() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let fwd = forward();
        let addr = fwd
            .start_forward("x", "tcp://127.0.0.1:0", &format!("tcp://{}", dead_addr))
            .await
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out).await;
        assert!(out.is_empty());
        fwd.stop().await;
    }

    #[tokio::test]
    async fn test_start_all() {
        let mut config = GatewayConfig::default();
        config.forwards.push(ForwardConfig::new("a", "tcp://127.0.0.1:0", "tcp://127.0.0.1:1"));
        config.forwards.push(ForwardConfig::new("b", "socks://127.0.0.1:0", "tcp://${HOST}"));
        config.idle_timeout = Some(Duration::from_secs(30));

        let fwd = Forward::from_config(
            &config,
            Arc::new(NetPiperDialer::new()),
            Logger::default(),
        );
        let addrs = fwd.start_all(&config).await.unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(fwd.forwards().len(), 2);

        config.forwards.push(ForwardConfig::new("a", "tcp://127.0.0.1:0", "x"));
        assert!(fwd.start_all(&config).await.is_err());
        assert!(fwd.forwards().is_empty());
    }
}
