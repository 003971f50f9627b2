//! WebSocket transport implementation

use super::{
    Capabilities, Link, LinkReader, OpenLink, ReadEvent, SendMode, SharedStats, TransportError,
    TransportKind, TransportStats,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Endpoint URL (`ws://` or `wss://`)
    pub url: String,
    /// Handshake timeout in seconds
    pub timeout_secs: u64,
}

impl SocketConfig {
    /// Create a new socket configuration
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim().to_string(),
            timeout_secs: 10,
        }
    }

    /// Set handshake timeout
    #[must_use]
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Only `ws://host...` and `wss://host...` are accepted
    pub fn validate(&self) -> Result<(), TransportError> {
        let rest = self
            .url
            .strip_prefix("ws://")
            .or_else(|| self.url.strip_prefix("wss://"))
            .ok_or_else(|| {
                TransportError::Configuration(format!(
                    "URL must start with ws:// or wss://: '{}'",
                    self.url
                ))
            })?;

        let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if host.is_empty() {
            return Err(TransportError::Configuration(format!(
                "URL has no host: '{}'",
                self.url
            )));
        }
        Ok(())
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self::new("ws://localhost:8080")
    }
}

pub(super) async fn open(config: &SocketConfig) -> Result<OpenLink, TransportError> {
    let (stream, response) = tokio::time::timeout(
        Duration::from_secs(config.timeout_secs),
        connect_async(config.url.as_str()),
    )
    .await
    .map_err(|_| {
        TransportError::ConnectFailure(format!(
            "handshake timed out after {} seconds",
            config.timeout_secs
        ))
    })?
    .map_err(|e| TransportError::ConnectFailure(e.to_string()))?;

    info!("Opened WebSocket {} (HTTP {})", config.url, response.status());

    let (sink, stream) = stream.split();
    let stats = SharedStats::new();

    let link = SocketLink {
        url: config.url.clone(),
        sink: Mutex::new(Some(sink)),
        open: AtomicBool::new(true),
        stats: stats.clone(),
    };
    let reader = SocketReader { stream, stats };

    Ok(OpenLink {
        link: Arc::new(link),
        reader: Box::new(reader),
    })
}

struct SocketLink {
    url: String,
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    open: AtomicBool,
    stats: SharedStats,
}

#[async_trait]
impl Link for SocketLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn name(&self) -> &str {
        &self.url
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STREAM
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn write(&self, data: Bytes, mode: SendMode) -> Result<(), TransportError> {
        let len = data.len();
        let message = match mode {
            SendMode::Binary => Message::Binary(data.to_vec()),
            SendMode::Text => Message::Text(String::from_utf8_lossy(&data).into_owned()),
        };

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(message)
            .await
            .map_err(|e| TransportError::WriteFailure(e.to_string()))?;

        self.stats.record_write(len);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            // The peer may already be gone; a failed close frame is not an error here.
            sink.send(Message::Close(None)).await.ok();
            sink.close().await.ok();
        }
        debug!("Closed WebSocket {}", self.url);
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

struct SocketReader {
    stream: SplitStream<WsStream>,
    stats: SharedStats,
}

#[async_trait]
impl LinkReader for SocketReader {
    async fn read(&mut self) -> Result<ReadEvent, TransportError> {
        loop {
            let data = match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => Bytes::from(data),
                Some(Ok(Message::Text(text))) => Bytes::from(text.into_bytes()),
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return Ok(ReadEvent::EndOfStream);
                }
                // Control frames are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::ReadFailure(e.to_string())),
                None => return Ok(ReadEvent::EndOfStream),
            };
            self.stats.record_read(data.len());
            return Ok(ReadEvent::Data(data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url_scheme() {
        assert!(SocketConfig::new("ws://localhost:8080").validate().is_ok());
        assert!(SocketConfig::new("wss://example.com/path?x=1").validate().is_ok());
        assert!(SocketConfig::new(" ws://10.0.0.2:81 ").validate().is_ok());

        for bad in ["http://example.com", "example.com", "ws://", "wss:///path", ""] {
            assert!(
                matches!(SocketConfig::new(bad).validate(), Err(TransportError::Configuration(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_open_refused_is_connect_failure() {
        // Port 9 (discard) is essentially never listening on loopback.
        let cfg = SocketConfig::new("ws://127.0.0.1:9").timeout(2);
        let err = open(&cfg).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailure(_)));
    }
}
