//! Byte-distribution multiplexer.
//!
//! A [`Distributor`] reads the first byte of every inbound connection,
//! replays it through a [`PrefixConn`], and hands the connection to the
//! processor registered for that byte (or the `'*'` wildcard). One listening
//! port can therefore serve several protocols whose first bytes differ.
//!
//! Every listener and connection the distributor is driving is registered
//! under a [`ConnId`] so [`Distributor::close`] can tear all of them down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::log::Logger;
use crate::metrics::RelayMetrics;
use crate::proxy::Processor;
use crate::transport::{BoxConn, Listener, PrefixConn};

/// Handle id for a tracked connection or listener.
pub type ConnId = u64;

/// Table key matching any leading byte without its own processor.
pub const WILDCARD: u8 = b'*';

/// Byte-distribution multiplexer.
pub struct Distributor {
    processors: RwLock<HashMap<u8, Arc<dyn Processor>>>,
    conns: Mutex<HashMap<ConnId, oneshot::Sender<()>>>,
    listeners: Mutex<HashMap<ConnId, oneshot::Sender<()>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    log: Logger,
    metrics: Arc<RelayMetrics>,
}

/// Unregisters a connection however its handler ends.
struct ConnGuard<'a> {
    dist: &'a Distributor,
    id: ConnId,
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        self.dist.conns.lock().remove(&self.id);
        self.dist.metrics.decrement_connections();
    }
}

impl Distributor {
    /// Create an empty distributor.
    pub fn new(log: Logger) -> Self {
        Self::with_metrics(log, Arc::new(RelayMetrics::new()))
    }

    /// Create an empty distributor reporting into `metrics`.
    pub fn with_metrics(log: Logger, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            processors: RwLock::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            log,
            metrics,
        }
    }

    /// Route connections starting with `tag` to `processor`, replacing any
    /// previous registration.
    pub fn add_processor(&self, tag: u8, processor: Arc<dyn Processor>) {
        self.processors.write().insert(tag, processor);
    }

    /// Stop routing `tag`. In-flight connections are unaffected.
    pub fn remove_processor(&self, tag: u8) -> Option<Arc<dyn Processor>> {
        self.processors.write().remove(&tag)
    }

    /// Whether `tag` has its own processor.
    pub fn has_processor(&self, tag: u8) -> bool {
        self.processors.read().contains_key(&tag)
    }

    /// Metrics this distributor reports into.
    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Number of connections currently being handled.
    pub fn conn_count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Number of accept loops currently running.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a closer; `None` when the distributor is already closed.
    fn register(
        &self,
        table: &Mutex<HashMap<ConnId, oneshot::Sender<()>>>,
    ) -> Option<(ConnId, oneshot::Receiver<()>)> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        table.lock().insert(id, tx);
        // close() flips the flag before draining; re-check so a racing
        // register is never left behind.
        if self.is_closed() {
            table.lock().remove(&id);
            return None;
        }
        Some((id, rx))
    }

    /// Accept connections from `listener` until it fails or the distributor
    /// is closed. Each connection is handled in its own task.
    pub async fn proc_accept<L: Listener>(self: &Arc<Self>, listener: L) -> Result<()> {
        let (id, mut stop) = match self.register(&self.listeners) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let local = listener.local_addr().ok();
        self.log
            .debug(format_args!("accept loop {} started on {:?}", id, local));

        let res = loop {
            let accepted = tokio::select! {
                _ = &mut stop => break Ok(()),
                res = listener.accept() => res,
            };
            match accepted {
                Ok((conn, peer)) => {
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.run_conn(conn, peer).await });
                }
                Err(e) => {
                    self.log
                        .warn(format_args!("accept on {:?} failed: {}", local, e));
                    break Err(Error::Network(e));
                }
            }
        };

        self.listeners.lock().remove(&id);
        self.log
            .debug(format_args!("accept loop {} stopped on {:?}", id, local));
        res
    }

    /// Per-connection task body; panics stop here.
    async fn run_conn(self: Arc<Self>, conn: BoxConn, peer: SocketAddr) {
        match AssertUnwindSafe(self.proc_conn(conn)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.log
                    .debug(format_args!("connection from {} ended: {}", peer, e));
            }
            Err(_) => {
                self.metrics.increment_panics();
                self.log
                    .error(format_args!("handler for {} panicked", peer));
            }
        }
    }

    async fn dispatch(&self, mut conn: BoxConn) -> Result<()> {
        let mut first = [0u8; 1];
        conn.read_exact(&mut first).await?;
        let tag = first[0];

        let processor = {
            let table = self.processors.read();
            table.get(&tag).or_else(|| table.get(&WILDCARD)).cloned()
        };
        let processor = match processor {
            Some(p) => p,
            None => {
                self.metrics.increment_rejected();
                return Err(Error::NoProcessor(tag));
            }
        };

        let conn = PrefixConn::new(conn, Bytes::copy_from_slice(&first));
        processor.proc_conn(Box::new(conn)).await
    }

    /// Close every tracked listener and connection. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping a closer resolves its receiver.
        let listeners: Vec<_> = self.listeners.lock().drain().collect();
        let conns: Vec<_> = self.conns.lock().drain().collect();
        self.log.debug(format_args!(
            "closing {} listeners and {} connections",
            listeners.len(),
            conns.len()
        ));
    }
}

#[async_trait]
impl Processor for Distributor {
    /// Dispatch `conn` by its first byte. The connection is closed when this
    /// returns, including when [`Distributor::close`] interrupts it.
    async fn proc_conn(&self, conn: BoxConn) -> Result<()> {
        let (id, stop) = match self.register(&self.conns) {
            Some(entry) => entry,
            None => return Err(Error::Closed),
        };
        self.metrics.increment_connections();
        let _guard = ConnGuard { dist: self, id };

        let res = tokio::select! {
            res = self.dispatch(conn) => res,
            _ = stop => Err(Error::Closed),
        };
        if res.is_err() {
            self.metrics.increment_failed();
        }
        res
    }
}

impl Drop for Distributor {
    fn drop(&mut self) {
        self.close();
    }
}
