//! HTTP proxy server and CONNECT client helper.
//!
//! `CONNECT host:port` opens a tunnel after a `200 Connection established`
//! reply. Any other method is forwarded: the request head (minus the
//! proxy-only headers) is replayed to the origin and the response is relayed
//! back unmodified until the origin closes, even after the client has
//! half-closed its side.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use httparse::{Request as HttpRequest, Response as HttpResponse, Status as HttpStatus, EMPTY_HEADER};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::error::{Error, Result};
use crate::log::Logger;
use crate::proxy::piper::PiperDialer;
use crate::proxy::Processor;
use crate::transport::{BoxConn, PrefixConn};

/// Largest request head accepted.
pub const MAX_HEAD_BYTES: usize = 32 * 1024;

/// Largest number of headers accepted.
pub const MAX_HEADERS: usize = 64;

/// Value of the `Proxy-Agent` header on CONNECT replies.
pub const PROXY_AGENT: &str = concat!("portmux/", env!("CARGO_PKG_VERSION"));

const HOP_HEADERS: [&str; 2] = ["proxy-authorization", "proxy-connection"];

const RESPONSE_500: &[u8] =
    b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Leading bytes of the HTTP methods the combined server routes here.
pub const METHOD_BYTES: [u8; 7] = [b'C', b'G', b'P', b'H', b'D', b'O', b'T'];

/// Parsed request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method
    pub method: String,
    /// Request target as sent
    pub target: String,
    /// Minor HTTP version
    pub version: u8,
    /// Headers in order, proxy-only headers removed
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Whether this is a CONNECT request.
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// First value of header `name`.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// `host:port` to dial for this request.
    pub fn authority(&self) -> Result<String> {
        if self.is_connect() {
            return Ok(with_default_port(&self.target, 443));
        }
        if let Ok(url) = Url::parse(&self.target) {
            if let Some(host) = url.host_str() {
                let port = url.port_or_known_default().unwrap_or(80);
                return Ok(format!("{}:{}", host, port));
            }
        }
        let host = self
            .header("host")
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::protocol("request has no absolute target or Host header"))?;
        Ok(with_default_port(host, 80))
    }

    /// Serialize the head for the origin server.
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

fn with_default_port(host: &str, port: u16) -> String {
    let has_port = if host.starts_with('[') {
        host.contains("]:")
    } else {
        host.contains(':')
    };
    if has_port {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

/// Parse a request head from `buf`; `None` when more bytes are needed.
pub fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>> {
    let mut headers_buf = [EMPTY_HEADER; MAX_HEADERS];
    let mut req = HttpRequest::new(&mut headers_buf);
    let head_len = match req.parse(buf) {
        Ok(HttpStatus::Complete(len)) => len,
        Ok(HttpStatus::Partial) => return Ok(None),
        Err(e) => return Err(Error::protocol(format!("invalid HTTP request: {}", e))),
    };

    let method = req
        .method
        .ok_or_else(|| Error::protocol("invalid HTTP request line"))?;
    let target = req
        .path
        .ok_or_else(|| Error::protocol("invalid HTTP request line"))?;
    let headers = req
        .headers
        .iter()
        .filter(|h| !HOP_HEADERS.iter().any(|hop| h.name.eq_ignore_ascii_case(hop)))
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect();

    Ok(Some((
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            version: req.version.unwrap_or(1),
            headers,
        },
        head_len,
    )))
}

/// Read one request head; returns it with the bytes read past it.
async fn read_head<R>(conn: &mut R) -> Result<(RequestHead, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if conn.read_buf(&mut buf).await? == 0 {
            return Err(Error::protocol("connection closed inside request head"));
        }
        if let Some((head, head_len)) = parse_head(&buf)? {
            let rest = buf.split_off(head_len).freeze();
            return Ok((head, rest));
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(Error::protocol(format!(
                "request head exceeds {} bytes",
                MAX_HEAD_BYTES
            )));
        }
    }
}

/// HTTP proxy protocol handler.
pub struct HttpServer {
    dialer: Arc<dyn PiperDialer>,
    buffer_size: usize,
    log: Logger,
}

impl HttpServer {
    /// Create a handler dialing through `dialer`.
    pub fn new(dialer: Arc<dyn PiperDialer>, buffer_size: usize, log: Logger) -> Self {
        Self {
            dialer,
            buffer_size,
            log,
        }
    }
}

#[async_trait]
impl Processor for HttpServer {
    async fn proc_conn(&self, mut conn: BoxConn) -> Result<()> {
        let (head, rest) = read_head(&mut conn).await?;
        let target = head.authority()?;
        self.log
            .debug(format_args!("http {} {} -> {}", head.method, head.target, target));

        let piper = match self.dialer.dial_piper(&target, self.buffer_size).await {
            Ok(piper) => piper,
            Err(e) => {
                self.log
                    .debug(format_args!("http dial {} failed: {}", target, e));
                let _ = conn.write_all(RESPONSE_500).await;
                return Err(e);
            }
        };

        if head.is_connect() {
            let reply = format!(
                "HTTP/1.1 200 Connection established\r\nProxy-Agent: {}\r\n\r\n",
                PROXY_AGENT
            );
            if let Err(e) = conn.write_all(reply.as_bytes()).await {
                let _ = piper.close().await;
                return Err(e.into());
            }
            piper
                .pipe_conn(Box::new(PrefixConn::new(conn, rest)), &target)
                .await
        } else {
            let mut replay = head.encode();
            replay.extend_from_slice(&rest);
            piper
                .pipe_request(Box::new(PrefixConn::new(conn, replay.freeze())), &target)
                .await
        }
    }
}

/// Send `CONNECT target` on `stream` and wait for a `200`.
///
/// Returns any bytes the proxy sent after its reply head.
pub async fn connect<S>(stream: &mut S, target: &str) -> Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
        target, target
    );
    stream.write_all(req.as_bytes()).await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::protocol("proxy closed before replying"));
        }
        let mut headers_buf = [EMPTY_HEADER; MAX_HEADERS];
        let mut resp = HttpResponse::new(&mut headers_buf);
        match resp.parse(&buf) {
            Ok(HttpStatus::Complete(len)) => {
                let code = resp.code.unwrap_or(0);
                if code != 200 {
                    return Err(Error::protocol(format!(
                        "proxy answered CONNECT {} with {}",
                        target, code
                    )));
                }
                return Ok(buf.split_off(len).freeze());
            }
            Ok(HttpStatus::Partial) if buf.len() < MAX_HEAD_BYTES => {}
            Ok(HttpStatus::Partial) => {
                return Err(Error::protocol("proxy reply head too large"))
            }
            Err(e) => return Err(Error::protocol(format!("invalid proxy reply: {}", e))),
        }
    }
}

/// Open a CONNECT tunnel to `target` through the HTTP proxy at `proxy`.
pub async fn dial(proxy: &str, target: &str) -> Result<PrefixConn<TcpStream>> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.set_nodelay(true)?;
    let rest = connect(&mut stream, target).await?;
    Ok(PrefixConn::new(stream, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::piper::NetPiperDialer;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const BODY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";

    async fn origin() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
        origin_after(Duration::ZERO).await
    }

    /// Answers every request with `BODY` after `delay` and reports the head
    /// it received.
    async fn origin_after(delay: Duration) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    while !head.ends_with(b"\r\n\r\n") {
                        if stream.read_exact(&mut byte).await.is_err() {
                            return;
                        }
                        head.push(byte[0]);
                    }
                    let _ = tx.send(head);
                    tokio::time::sleep(delay).await;
                    let _ = stream.write_all(BODY).await;
                });
            }
        });
        (addr, rx)
    }

    async fn proxy() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(HttpServer::new(
            Arc::new(NetPiperDialer::new()),
            4096,
            Logger::default(),
        ));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    let _ = server.proc_conn(Box::new(stream)).await;
                });
            }
        });
        addr
    }

    async fn fetch<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S, host: &str) -> Vec<u8> {
        let req = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", host);
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn test_parse_head_strips_proxy_headers() {
        let raw = b"GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: Basic Zm9v\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\nbody";
        let (head, len) = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(len, raw.len() - 4);
        assert_eq!(head.headers.len(), 2);
        assert!(head.header("proxy-connection").is_none());
        assert_eq!(head.authority().unwrap(), "example.com:80");

        let encoded = head.encode();
        assert!(encoded.starts_with(b"GET http://example.com/x HTTP/1.1\r\n"));
        assert!(encoded.ends_with(b"Accept: */*\r\n\r\n"));
    }

    #[test]
    fn test_parse_head_partial() {
        assert!(parse_head(b"GET / HTTP/1.1\r\nHost: a").unwrap().is_none());
        assert!(parse_head(b"\x00\x01 nonsense\r\n\r\n").is_err());
    }

    #[test]
    fn test_authority() {
        let (head, _) = parse_head(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.authority().unwrap(), "example.com:8080");

        let (head, _) = parse_head(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(head.is_connect());
        assert_eq!(head.authority().unwrap(), "example.com:443");

        let (head, _) = parse_head(b"GET / HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert!(head.authority().is_err());
    }

    #[tokio::test]
    async fn test_connect_matches_direct_fetch() {
        let (origin, _heads) = origin().await;
        let proxy = proxy().await;

        let direct = fetch(TcpStream::connect(origin).await.unwrap(), "origin").await;
        let tunneled = fetch(
            dial(&proxy.to_string(), &origin.to_string()).await.unwrap(),
            "origin",
        )
        .await;
        assert_eq!(direct, BODY);
        assert_eq!(tunneled, direct);
    }

    #[tokio::test]
    async fn test_forward_request() {
        let (origin, mut heads) = origin().await;
        let proxy = proxy().await;

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        let req = format!(
            "GET http://{}/index HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
            origin, origin
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, BODY);

        let head = String::from_utf8(heads.recv().await.unwrap()).unwrap();
        assert!(head.starts_with(&format!("GET http://{}/index HTTP/1.1\r\n", origin)));
        assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
    }

    #[tokio::test]
    async fn test_forward_response_after_client_half_close() {
        let (origin, mut heads) = origin_after(Duration::from_millis(50)).await;
        let proxy = proxy().await;

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        let req = format!("GET http://{}/ HTTP/1.0\r\n\r\n", origin);
        stream.write_all(req.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, BODY);

        let head = String::from_utf8(heads.recv().await.unwrap()).unwrap();
        assert_eq!(head, format!("GET http://{}/ HTTP/1.0\r\n\r\n", origin));
    }

    #[tokio::test]
    async fn test_unreachable_is_500() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);
        let proxy = proxy().await;

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        let err = connect(&mut stream, &dead.to_string()).await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
