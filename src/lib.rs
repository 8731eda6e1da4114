//! # portmux
//!
//! A protocol-multiplexing relay gateway. One listening port inspects the
//! first byte of each inbound stream, speaks SOCKS5, HTTP proxy or a
//! WebSocket tunnel accordingly, dials the requested target through a
//! pluggable dialer and relays bytes until either side closes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Forward manager (named listeners, start / stop)        │
//! ├─────────────────────────────────────────────────────────┤
//! │  Distributor (leading byte → processor, '*' fallback)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Handlers: SOCKS5 · HTTP CONNECT/forward · WebSocket    │
//! ├─────────────────────────────────────────────────────────┤
//! │  PiperDialer → Piper (router templating, relay)         │
//! ├─────────────────────────────────────────────────────────┤
//! │  Transport: prefix reads, pending gate, frames, idle    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use portmux::log::Logger;
//! use portmux::proxy::NetPiperDialer;
//! use portmux::server::Forward;
//!
//! # async fn run() -> portmux::Result<()> {
//! let forward = Forward::new(Arc::new(NetPiperDialer::new()), Logger::default());
//! forward
//!     .start_forward("socks", "socks://127.0.0.1:1080", "tcp://${HOST}")
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod log;
pub mod metrics;
pub mod proxy;
pub mod transport;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};
pub use log::Logger;
pub use metrics::RelayMetrics;
pub use proxy::{Distributor, Piper, PiperDialer, Processor};
pub use transport::{BoxConn, Listener};
