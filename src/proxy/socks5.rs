//! SOCKS5 server and client helpers.
//!
//! Server: no-auth greeting, CONNECT only, IPv4 / domain / `0x13` ("BS")
//! targets. The client connection is wrapped in a [`PendingConn`] before the
//! dialer sees it, so a dialer may start relaying immediately while the
//! handler still owns the reply.
//!
//! ```text
//! greeting  05 NMETHODS METHODS...        -> 05 00
//! request   05 01 00 ATYP ADDR PORT(2)    -> 05 REP 00 01 0.0.0.0 0
//! ```

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::error::{Error, Result, DEFAULT_STATUS_CODE};
use crate::log::Logger;
use crate::proxy::piper::PiperDialer;
use crate::proxy::relay::relay;
use crate::proxy::Processor;
use crate::transport::{BoxConn, PendingConn, DEFAULT_BUFFER_SIZE};

/// Protocol version byte.
pub const SOCKS_VERSION: u8 = 0x05;
/// CONNECT command.
pub const CMD_CONNECT: u8 = 0x01;
/// No authentication required.
pub const METHOD_NO_AUTH: u8 = 0x00;
/// IPv4 address type.
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type.
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type (accepted in replies only).
pub const ATYP_IPV6: u8 = 0x04;
/// Vendor "BS" address type: domain-shaped opaque routing hint.
pub const ATYP_BS: u8 = 0x13;
/// Success reply code.
pub const REPLY_SUCCEEDED: u8 = 0x00;
/// Command not supported reply code.
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Address type of a requested target, as reported to the dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriKind {
    /// `a.b.c.d:port`
    Ipv4,
    /// `domain:port`
    Domain,
    /// `0x13` hint: `domain:port`, or the bare domain bytes when the port is 0
    Bs,
}

/// Outcome of a successful SOCKS dial.
pub enum Dialed {
    /// Outbound stream the handler relays against the client.
    Stream(BoxConn),
    /// The dialer is already relaying the pending connection in this task.
    Piped(JoinHandle<Result<()>>),
}

/// Dialer consulted by [`SocksServer`] once the target is known.
#[async_trait]
pub trait SocksDialer: Send + Sync {
    /// Dial `uri`. `conn` stays gated until the handler has replied.
    async fn dial_socks(&self, kind: UriKind, uri: &str, conn: PendingConn) -> Result<Dialed>;
}

/// [`SocksDialer`] that pipes the pending connection through a
/// [`PiperDialer`].
pub struct PiperSocksDialer {
    dialer: Arc<dyn PiperDialer>,
    buffer_size: usize,
}

impl PiperSocksDialer {
    /// Adapt `dialer`; pipes use buffers of `buffer_size` bytes.
    pub fn new(dialer: Arc<dyn PiperDialer>, buffer_size: usize) -> Self {
        Self {
            dialer,
            buffer_size,
        }
    }
}

#[async_trait]
impl SocksDialer for PiperSocksDialer {
    async fn dial_socks(&self, _kind: UriKind, uri: &str, conn: PendingConn) -> Result<Dialed> {
        let piper = self.dialer.dial_piper(uri, self.buffer_size).await?;
        let target = uri.to_string();
        let task = tokio::spawn(async move { piper.pipe_conn(Box::new(conn), &target).await });
        Ok(Dialed::Piped(task))
    }
}

/// Aborts a dialer's relay task if the handler goes away first.
struct PipeTask(JoinHandle<Result<()>>);

impl PipeTask {
    async fn join(&mut self) -> Result<()> {
        match (&mut self.0).await {
            Ok(res) => res,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(Error::Closed),
        }
    }
}

impl Drop for PipeTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Reply with `code` and an all-zero IPv4 bind address.
pub fn reply(code: u8) -> [u8; 10] {
    [SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// SOCKS5 protocol handler.
pub struct SocksServer {
    dialer: Arc<dyn SocksDialer>,
    buffer_size: usize,
    log: Logger,
}

impl SocksServer {
    /// Create a handler dialing through `dialer`.
    pub fn new(dialer: Arc<dyn SocksDialer>, log: Logger) -> Self {
        Self {
            dialer,
            buffer_size: DEFAULT_BUFFER_SIZE,
            log,
        }
    }

    /// Relay buffer size for [`Dialed::Stream`] results.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    async fn greet(&self, conn: &mut BoxConn) -> Result<()> {
        let mut head = [0u8; 2];
        conn.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(Error::VersionMismatch {
                expected: SOCKS_VERSION,
                actual: head[0],
            });
        }
        let mut methods = vec![0u8; head[1] as usize];
        conn.read_exact(&mut methods).await?;

        conn.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    }

    async fn read_request(&self, conn: &mut BoxConn) -> Result<(UriKind, String)> {
        let mut req = [0u8; 5];
        conn.read_exact(&mut req).await?;
        if req[0] != SOCKS_VERSION {
            return Err(Error::VersionMismatch {
                expected: SOCKS_VERSION,
                actual: req[0],
            });
        }
        if req[1] != CMD_CONNECT {
            conn.write_all(&reply(REPLY_COMMAND_NOT_SUPPORTED)).await?;
            return Err(Error::Command(req[1]));
        }
        read_target(conn, req[3], req[4]).await
    }
}

/// Read the rest of a request address; `first` is the address byte already
/// consumed with the fixed header.
async fn read_target<R>(conn: &mut R, atyp: u8, first: u8) -> Result<(UriKind, String)>
where
    R: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut rest = [0u8; 5];
            conn.read_exact(&mut rest).await?;
            let ip = Ipv4Addr::new(first, rest[0], rest[1], rest[2]);
            let port = u16::from_be_bytes([rest[3], rest[4]]);
            Ok((UriKind::Ipv4, format!("{}:{}", ip, port)))
        }
        ATYP_DOMAIN | ATYP_BS => {
            let len = first as usize;
            let mut rest = vec![0u8; len + 2];
            conn.read_exact(&mut rest).await?;
            let port = u16::from_be_bytes([rest[len], rest[len + 1]]);
            rest.truncate(len);
            let domain = String::from_utf8(rest)
                .map_err(|_| Error::protocol("request domain is not valid UTF-8"))?;

            if atyp == ATYP_BS {
                if port == 0 {
                    Ok((UriKind::Bs, domain))
                } else {
                    Ok((UriKind::Bs, format!("{}:{}", domain, port)))
                }
            } else {
                Ok((UriKind::Domain, format!("{}:{}", domain, port)))
            }
        }
        other => Err(Error::AddressType(other)),
    }
}

#[async_trait]
impl Processor for SocksServer {
    async fn proc_conn(&self, mut conn: BoxConn) -> Result<()> {
        self.greet(&mut conn).await?;
        let (kind, uri) = self.read_request(&mut conn).await?;
        self.log
            .debug(format_args!("socks5 connect {} ({:?})", uri, kind));

        let pending = PendingConn::new(conn, Bytes::new());
        let dialed = match self.dialer.dial_socks(kind, &uri, pending.clone()).await {
            Ok(dialed) => dialed,
            Err(e) => {
                let code = e.status_code().unwrap_or(DEFAULT_STATUS_CODE);
                self.log.debug(format_args!(
                    "socks5 dial {} failed with 0x{:02x}: {}",
                    uri, code, e
                ));
                let _ = pending.write_direct(&reply(code)).await;
                pending.close();
                return Err(e);
            }
        };

        match dialed {
            Dialed::Stream(stream) => {
                if let Err(e) = pending.write_direct(&reply(REPLY_SUCCEEDED)).await {
                    pending.close();
                    return Err(e.into());
                }
                pending.start();
                relay(pending, stream, self.buffer_size).await?;
                Ok(())
            }
            Dialed::Piped(task) => {
                let mut task = PipeTask(task);
                if let Err(e) = pending.write_direct(&reply(REPLY_SUCCEEDED)).await {
                    pending.close();
                    return Err(e.into());
                }
                pending.start();
                drop(pending);
                task.join().await
            }
        }
    }
}

fn split_host_port(uri: &str) -> Result<(&str, u16)> {
    let (host, port) = uri
        .rsplit_once(':')
        .ok_or_else(|| Error::protocol(format!("missing port in {}", uri)))?;
    let port = port
        .parse()
        .map_err(|_| Error::protocol(format!("invalid port in {}", uri)))?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

/// Run the client handshake on `stream`, asking for `uri` (`host:port`).
pub async fn connect<S>(stream: &mut S, uri: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = split_host_port(uri)?;
    request(stream, ATYP_DOMAIN, host.as_bytes(), port, uri).await
}

/// Run the client handshake with a `0x13` request carrying `hint` as-is.
pub async fn connect_bs<S>(stream: &mut S, hint: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    request(stream, ATYP_BS, hint.as_bytes(), 0, hint).await
}

async fn request<S>(stream: &mut S, atyp: u8, addr: &[u8], port: u16, uri: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if addr.len() > u8::MAX as usize {
        return Err(Error::protocol(format!("target too long: {}", uri)));
    }

    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method[0] != SOCKS_VERSION {
        return Err(Error::VersionMismatch {
            expected: SOCKS_VERSION,
            actual: method[0],
        });
    }
    if method[1] != METHOD_NO_AUTH {
        return Err(Error::protocol(format!(
            "proxy selected unsupported method 0x{:02x}",
            method[1]
        )));
    }

    let mut req = Vec::with_capacity(7 + addr.len());
    req.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, atyp, addr.len() as u8]);
    req.extend_from_slice(addr);
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::VersionMismatch {
            expected: SOCKS_VERSION,
            actual: head[0],
        });
    }
    if head[1] != REPLY_SUCCEEDED {
        return Err(Error::status(
            head[1],
            format!("socks5 connect to {} refused", uri),
        ));
    }

    // Bound address trailer, discarded
    let trailer = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN | ATYP_BS => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => return Err(Error::AddressType(other)),
    };
    let mut bound = vec![0u8; trailer];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

/// Connect to the SOCKS5 proxy at `proxy` and CONNECT to `uri`.
pub async fn dial(proxy: &str, uri: &str) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.set_nodelay(true)?;
    connect(&mut stream, uri).await?;
    Ok(stream)
}

/// Connect to the SOCKS5 proxy at `proxy` with a `0x13` request for `hint`.
pub async fn dial_bs(proxy: &str, hint: &str) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.set_nodelay(true)?;
    connect_bs(&mut stream, hint).await?;
    Ok(stream)
}
