//! WebSocket transport (spec §4.4).
//!
//! `WsTransport` is grounded almost verbatim on the teacher's `ws.rs`:
//! the same split reader/writer wrapper around `tokio-tungstenite`, the
//! same `http_to_ws_scheme` helper, the same frame-to-message mapping.
//! Generalized into a `Transport` trait object so the connection
//! controller can be driven by a mock in tests without a real socket
//! (spec §2.4).

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::error::{Error, Result};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// What the transport yielded from a single `recv` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A text frame, the only frame kind this protocol uses for payloads.
    Text(String),
    /// The peer (or transport) closed the connection.
    Closed {
        /// WebSocket close code, or 1005 ("no status received") if absent.
        code: u16,
        /// Close reason, empty if the peer sent none.
        reason: String,
    },
}

/// The WebSocket attach/detach/send/receive contract the connection
/// controller drives (spec §4.4). Implementors must make `is_open` return
/// `true` only when the underlying socket is actually in the OPEN state —
/// not merely "not yet observed to close" — since keepalive or a peer close
/// may transition the socket without the receive loop having returned yet.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `url`. Must be callable again after `close` to
    /// support reconnection.
    async fn open(&mut self, url: &str) -> Result<()>;

    /// Send a text frame. Serialized by the caller — the controller owns
    /// the single outbound writer (spec §5).
    async fn send(&mut self, bytes: &str) -> Result<()>;

    /// Block until the next message or close/error.
    async fn recv(&mut self) -> Result<Received>;

    /// Close the connection. Idempotent.
    async fn close(&mut self);

    /// Cheap, synchronous liveness check. `false` after `close` or after a
    /// close frame/error has been observed by `recv`.
    fn is_open(&self) -> bool;
}

/// Default [`Transport`] backed by `tokio-tungstenite`.
pub struct WsTransport {
    sink: Option<futures_util::stream::SplitSink<WsStream, tungstenite::Message>>,
    stream: Option<futures_util::stream::SplitStream<WsStream>>,
    open: AtomicBool,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WsTransport {
    /// An unopened transport. Call `open` before `send`/`recv`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sink: None,
            stream: None,
            open: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&mut self, url: &str) -> Result<()> {
        use tungstenite::client::IntoClientRequest;

        let request = url
            .into_client_request()
            .map_err(|e| Error::Connection(format!("invalid WebSocket URL {url}: {e}")))?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Connection(format!("WebSocket connect failed: {e}")))?;

        let (sink, stream) = ws_stream.split();
        self.sink = Some(sink);
        self.stream = Some(stream);
        self.open.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn send(&mut self, bytes: &str) -> Result<()> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| Error::Connection("transport is not open".to_string()))?;

        sink.send(tungstenite::Message::Text(bytes.to_string()))
            .await
            .map_err(|e| {
                self.open.store(false, Ordering::Relaxed);
                Error::Connection(format!("WebSocket send failed: {e}"))
            })
    }

    async fn recv(&mut self) -> Result<Received> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Connection("transport is not open".to_string()))?;

        loop {
            match stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Ok(Received::Text(text.to_string()));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    self.open.store(false, Ordering::Relaxed);
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Ok(Received::Closed { code, reason });
                }
                Some(Ok(
                    tungstenite::Message::Binary(_)
                    | tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_)
                    | tungstenite::Message::Frame(_),
                )) => {
                    // This protocol only carries text payloads; ping/pong
                    // are handled by tungstenite automatically, binary and
                    // raw frames never appear, skip and keep reading.
                    continue;
                }
                Some(Err(e)) => {
                    self.open.store(false, Ordering::Relaxed);
                    return Err(Error::Connection(format!("WebSocket read error: {e}")));
                }
                None => {
                    self.open.store(false, Ordering::Relaxed);
                    return Ok(Received::Closed {
                        code: 1005,
                        reason: String::new(),
                    });
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            let _ = sink.close().await;
        }
        self.open.store(false, Ordering::Relaxed);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme, passing `ws://`/`wss://` through
/// unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://").replace("http://", "ws://")
    }
}
