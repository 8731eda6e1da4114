//! WebSocket tunnel.
//!
//! The server side upgrades an inbound connection, reads the tunnel target
//! from the `_uri` query value of the handshake request, dials it, and pipes
//! the WebSocket-backed stream to it. The client side performs the mirror
//! handshake and returns a byte stream carried in binary messages.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::error::{Error, Result};
use crate::log::Logger;
use crate::proxy::piper::PiperDialer;
use crate::proxy::Processor;
use crate::transport::BoxConn;

/// Query key carrying the tunnel target.
pub const URI_QUERY_KEY: &str = "_uri";

/// Byte stream over a WebSocket.
///
/// Writes become binary messages; reads concatenate binary (and text)
/// message payloads. A close frame or the end of the message stream is EOF.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
}

impl<S> WsStream<S> {
    /// Adapt an upgraded WebSocket.
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let to_copy = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..to_copy]);
                this.pending.advance(to_copy);
                return Poll::Ready(Ok(()));
            }

            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(msg))) => match msg {
                    Message::Binary(data) => this.pending = Bytes::from(data),
                    Message::Text(text) => this.pending = Bytes::from(text.into_bytes()),
                    Message::Close(_) => return Poll::Ready(Ok(())),
                    // Pongs are queued by tungstenite itself
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                },
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::other(Error::from(e))))
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.inner.poll_ready_unpin(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(io::Error::other(Error::from(e)))),
            Poll::Pending => return Poll::Pending,
        }
        this.inner
            .start_send_unpin(Message::Binary(data.to_vec()))
            .map_err(|e| io::Error::other(Error::from(e)))?;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .inner
            .poll_flush_unpin(cx)
            .map_err(|e| io::Error::other(Error::from(e)))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .inner
            .poll_close_unpin(cx)
            .map_err(|e| io::Error::other(Error::from(e)))
    }
}

/// Value of `_uri` in a request query string.
pub fn query_target(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == URI_QUERY_KEY)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn bad_request(reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = StatusCode::BAD_REQUEST;
    resp
}

/// WebSocket tunnel server.
pub struct WsServer {
    dialer: Arc<dyn PiperDialer>,
    buffer_size: usize,
    log: Logger,
}

impl WsServer {
    /// Create a tunnel server dialing targets through `dialer`.
    pub fn new(dialer: Arc<dyn PiperDialer>, buffer_size: usize, log: Logger) -> Self {
        Self {
            dialer,
            buffer_size,
            log,
        }
    }
}

#[async_trait]
impl Processor for WsServer {
    async fn proc_conn(&self, conn: BoxConn) -> Result<()> {
        let mut target = None;
        let callback = |req: &Request, resp: Response| {
            match query_target(req.uri().query()) {
                Some(uri) => {
                    target = Some(uri);
                    Ok(resp)
                }
                None => Err(bad_request("missing _uri")),
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(conn, callback).await?;
        let target = target.ok_or_else(|| Error::protocol("websocket request without _uri"))?;

        let piper = match self.dialer.dial_piper(&target, self.buffer_size).await {
            Ok(piper) => piper,
            Err(e) => {
                self.log
                    .debug(format_args!("ws dial {} failed: {}", target, e));
                return Err(e);
            }
        };
        self.log.debug(format_args!("ws tunnel to {}", target));
        piper.pipe_conn(Box::new(WsStream::new(ws)), &target).await
    }
}

/// Open a WebSocket to `ws_url` exactly as given.
pub async fn connect(ws_url: &str) -> Result<WsStream<TcpStream>> {
    let url = Url::parse(ws_url).map_err(|e| Error::config(format!("{}: {}", ws_url, e)))?;
    if url.scheme() != "ws" {
        return Err(Error::config(format!("not a ws:// url: {}", ws_url)));
    }
    let host = url
        .host_str()
        .ok_or_else(|| Error::config(format!("no host in {}", ws_url)))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true)?;
    let (ws, _resp) = tokio_tungstenite::client_async(url.as_str(), tcp).await?;
    Ok(WsStream::new(ws))
}

/// Open a tunnel to `uri` through the WebSocket gateway at `ws_url`.
pub async fn dial(ws_url: &str, uri: &str) -> Result<WsStream<TcpStream>> {
    let mut url = Url::parse(ws_url).map_err(|e| Error::config(format!("{}: {}", ws_url, e)))?;
    url.query_pairs_mut().append_pair(URI_QUERY_KEY, uri);
    connect(url.as_str()).await
}

/// Close a tunnel stream with a close frame.
pub async fn close<S>(stream: &mut WsStream<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.inner.close(None).await?;
    Ok(())
}
