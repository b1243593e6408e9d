//! Streaming transport seam
//!
//! The session only ever talks to a `StreamTransport`; `WsConnector` is the
//! tokio-tungstenite implementation used in production.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace};

use crate::rotation::Endpoint;

#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn StreamTransport>>;
}

/// One open bidirectional connection.
#[async_trait]
pub trait StreamTransport: Send {
    async fn send(&mut self, payload: String) -> Result<()>;

    /// Next inbound payload. `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<Vec<u8>>>;

    async fn close(&mut self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn StreamTransport>> {
        let (ws, response) = connect_async(endpoint.uri())
            .await
            .with_context(|| format!("websocket connect to {endpoint}"))?;
        debug!(endpoint = %endpoint, status = %response.status(), "ws_connected");
        Ok(Box::new(WsTransport { ws }))
    }
}

struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn send(&mut self, payload: String) -> Result<()> {
        self.ws
            .send(Message::Text(payload))
            .await
            .context("websocket send")
    }

    /// Cancel safe: only reads, so dropping it inside `select!` loses
    /// nothing.
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.into_bytes())),
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                // tungstenite queues the pong itself and flushes it on the
                // next read or write.
                Ok(Message::Ping(_)) => trace!("ping"),
                Ok(Message::Pong(_)) => trace!("pong"),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "server_close");
                    return None;
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(anyhow::Error::new(e).context("websocket read"))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
