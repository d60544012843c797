//! WebSocket client for exchange streams
//!
//! Handles connection, subscription, message reception and idle detection.
//! The socket lives inside the client: dropping the client (for example when
//! the owning listener is cancelled) closes the connection.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{Result, TrackerError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for a single connection
pub struct WebSocketClient {
    stream: Option<WsStream>,
    url: String,
    /// Silence tolerated before a ping is sent
    read_timeout: Duration,
    /// Time allowed for any frame to arrive after a ping
    pong_timeout: Duration,
}

impl WebSocketClient {
    /// Create a new WebSocket client
    pub fn new(url: &str, read_timeout: Duration, pong_timeout: Duration) -> Self {
        Self {
            stream: None,
            url: url.to_string(),
            read_timeout,
            pong_timeout,
        }
    }

    /// Connect to the WebSocket endpoint
    pub async fn connect(&mut self) -> Result<()> {
        info!(url = %self.url, "Connecting to WebSocket");

        let (ws_stream, response) = connect_async(self.url.as_str()).await.map_err(|e| {
            TrackerError::WebSocketConnection(format!("Failed to connect to {}: {}", self.url, e))
        })?;

        info!(status = ?response.status(), "WebSocket connected");
        self.stream = Some(ws_stream);

        Ok(())
    }

    /// Send a JSON request (subscribe/unsubscribe envelopes)
    pub async fn send_json(&mut self, payload: &serde_json::Value) -> Result<()> {
        let stream = self.stream_mut()?;
        stream
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| TrackerError::WebSocketMessage(e.to_string()))
    }

    /// Receive the next frame; `None` for control frames
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let stream = self.stream_mut()?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!(len = text.len(), "Received text message");
                Ok(Some(text))
            }
            Some(Ok(Message::Binary(data))) => {
                let text = String::from_utf8_lossy(&data).to_string();
                Ok(Some(text))
            }
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Some(stream) = self.stream.as_mut() {
                    let _ = stream.send(Message::Pong(data)).await;
                }
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) => {
                debug!("Received pong");
                Ok(None)
            }
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Err(TrackerError::WebSocketConnection(
                    "Connection closed".to_string(),
                ))
            }
            Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(TrackerError::WebSocketMessage(e.to_string()))
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Err(TrackerError::WebSocketConnection(
                    "Stream ended".to_string(),
                ))
            }
        }
    }

    /// Wait for the next text payload, pinging an idle connection.
    ///
    /// After `read_timeout` without any frame a ping is sent; if nothing at
    /// all (pong or data) arrives within `pong_timeout` the connection is
    /// considered lost.
    pub async fn next_text(&mut self) -> Result<String> {
        let mut awaiting_pong = false;

        loop {
            let wait = if awaiting_pong {
                self.pong_timeout
            } else {
                self.read_timeout
            };

            match timeout(wait, self.recv()).await {
                Ok(Ok(Some(text))) => return Ok(text),
                Ok(Ok(None)) => {
                    awaiting_pong = false;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) if awaiting_pong => {
                    warn!(
                        pong_timeout_secs = self.pong_timeout.as_secs(),
                        "No pong received, dropping connection"
                    );
                    return Err(TrackerError::ConnectionTimeout);
                }
                Err(_) => {
                    debug!(
                        read_timeout_secs = self.read_timeout.as_secs(),
                        "No message received within timeout, sending ping"
                    );
                    self.ping().await?;
                    awaiting_pong = true;
                }
            }
        }
    }

    /// Send a ping to keep connection alive
    pub async fn ping(&mut self) -> Result<()> {
        let stream = self.stream_mut()?;
        stream
            .send(Message::Ping(vec![]))
            .await
            .map_err(|e| TrackerError::WebSocketMessage(e.to_string()))
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the connection
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }

    fn stream_mut(&mut self) -> Result<&mut WsStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| TrackerError::WebSocketConnection("Not connected".to_string()))
    }
}
