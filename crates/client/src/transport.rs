//! Transport channel: one framed bidirectional connection to the server.
//!
//! A `Connection` is a pair of channels. The WebSocket implementation bridges
//! them to the socket with a writer task and a reader task; the inbound
//! channel closing is how a dead socket shows up to the engine.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;

const OUTBOUND_CAPACITY: usize = 100;
const INBOUND_CAPACITY: usize = 256;

/// Frames the engine writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Ping(Bytes),
}

/// Frames the engine reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Pong(Bytes),
}

pub struct Connection {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub inbound: mpsc::Receiver<InboundFrame>,
}

pub trait Transport: Send + Sync + 'static {
    /// Open a new connection. Socket-open only; liveness is checked separately.
    fn connect(&self) -> BoxFuture<'static, Result<Connection, TransportError>>;
}

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    auth_token: Option<String>,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, auth_token: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            auth_token,
            connect_timeout,
        }
    }
}

impl Transport for WsTransport {
    fn connect(&self) -> BoxFuture<'static, Result<Connection, TransportError>> {
        let url = self.url.clone();
        let token = self.auth_token.clone();
        let timeout = self.connect_timeout;
        async move { connect_ws(&url, token.as_deref(), timeout).await }.boxed()
    }
}

async fn connect_ws(
    url: &str,
    auth_token: Option<&str>,
    connect_timeout: Duration,
) -> Result<Connection, TransportError> {
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        return Err(TransportError::InvalidUrl(url.to_string()));
    }

    let mut request = url.into_client_request()?;
    if let Some(token) = auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::InvalidHeader(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (stream, _response) = tokio::time::timeout(connect_timeout, connect_async(request))
        .await
        .map_err(|_| TransportError::ConnectTimeout(connect_timeout))??;

    info!(
        component = "transport",
        event = "transport.socket.opened",
        url = %url,
        "WebSocket opened"
    );

    let (mut ws_tx, mut ws_rx) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundFrame>(INBOUND_CAPACITY);

    // Writer: ends when the engine drops its sender, closing the socket.
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let msg = match frame {
                OutboundFrame::Text(text) => Message::Text(text.into()),
                OutboundFrame::Ping(data) => Message::Ping(data),
            };
            if let Err(e) = ws_tx.send(msg).await {
                debug!(
                    component = "transport",
                    event = "transport.send.failed",
                    error = %e,
                    "WebSocket send failed"
                );
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Reader: ends on close/error; dropping `inbound_tx` signals the engine.
    tokio::spawn(async move {
        while let Some(result) = ws_rx.next().await {
            let frame = match result {
                Ok(Message::Text(text)) => InboundFrame::Text(text.as_str().to_owned()),
                Ok(Message::Pong(data)) => InboundFrame::Pong(data),
                Ok(Message::Close(frame)) => {
                    info!(
                        component = "transport",
                        event = "transport.socket.close_frame",
                        reason = ?frame.map(|f| f.reason.as_str().to_owned()),
                        "Server sent close frame"
                    );
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(
                        component = "transport",
                        event = "transport.receive.error",
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
            };
            if inbound_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    Ok(Connection {
        outbound: outbound_tx,
        inbound: inbound_rx,
    })
}

/// Round-trip a ping before trusting a fresh socket. Text frames that arrive
/// while waiting are returned so the caller can dispatch them.
pub async fn verify_liveness(
    conn: &mut Connection,
    timeout: Duration,
) -> Result<Vec<String>, TransportError> {
    let payload = Bytes::from(Uuid::new_v4().to_string());
    conn.outbound
        .send(OutboundFrame::Ping(payload.clone()))
        .await
        .map_err(|_| TransportError::Closed)?;

    let mut early = Vec::new();
    let wait = async {
        loop {
            match conn.inbound.recv().await {
                Some(InboundFrame::Pong(data)) if data == payload => return Ok(()),
                Some(InboundFrame::Pong(_)) => continue,
                Some(InboundFrame::Text(text)) => early.push(text),
                None => return Err(TransportError::Closed),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| TransportError::ProbeTimeout(timeout))??;
    Ok(early)
}
