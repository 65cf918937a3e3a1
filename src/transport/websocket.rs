//! tokio-tungstenite backed transport

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::{FrameSink, Transport, TransportEvent, TransportLink};
use crate::error::{DerivError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound event buffer per link
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// WebSocket transport with a bounded connect wait
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<TransportLink> {
        info!("Connecting to WebSocket: {}", redact(url));

        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                DerivError::Connection(format!(
                    "WebSocket connection timeout after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| DerivError::Connection(format!("WebSocket handshake failed: {e}")))?;

        info!("WebSocket connected");

        let (write, read) = ws_stream.split();
        let sink = Arc::new(WsSink {
            write: Mutex::new(write),
        });
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(pump_inbound(read, Arc::clone(&sink), events_tx));

        Ok(TransportLink {
            sink,
            events: events_rx,
        })
    }
}

struct WsSink {
    write: Mutex<SplitSink<WsStream, Message>>,
}

impl WsSink {
    async fn send_message(&self, message: Message) -> Result<()> {
        let mut write = self.write.lock().await;
        write.send(message).await?;
        Ok(())
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&self, frame: String) -> Result<()> {
        self.send_message(Message::Text(frame)).await
    }

    async fn close(&self) -> Result<()> {
        let mut write = self.write.lock().await;
        write.close().await?;
        Ok(())
    }
}

/// Forward socket reads as transport events until the socket ends
async fn pump_inbound(
    mut read: SplitStream<WsStream>,
    sink: Arc<WsSink>,
    events: mpsc::Sender<TransportEvent>,
) {
    let terminal = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                if events.send(TransportEvent::Frame(text)).await.is_err() {
                    debug!("Link receiver dropped; stopping reader");
                    return;
                }
            }
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => {
                    if events.send(TransportEvent::Frame(text)).await.is_err() {
                        return;
                    }
                }
                Err(_) => warn!("Dropping non-UTF8 binary frame"),
            },
            Some(Ok(Message::Ping(data))) => {
                if let Err(e) = sink.send_message(Message::Pong(data)).await {
                    break TransportEvent::Error(format!("failed to send pong: {e}"));
                }
            }
            Some(Ok(Message::Close(frame))) => {
                info!("Received close frame");
                break TransportEvent::Closed(frame.map(|f| f.reason.to_string()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break TransportEvent::Error(e.to_string()),
            None => break TransportEvent::Closed(None),
        }
    };

    let _ = events.send(terminal).await;
}

/// Endpoint for logs, without query parameters
fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_strips_query() {
        let url = Url::parse("wss://ws.binaryws.com/websockets/v3?app_id=1089").unwrap();
        assert_eq!(redact(&url), "wss://ws.binaryws.com/websockets/v3");
    }

    #[tokio::test]
    async fn test_open_unreachable_host_fails() {
        let transport = WebSocketTransport::new(Duration::from_millis(500));
        let url = Url::parse("ws://127.0.0.1:1/").unwrap();
        let result = transport.open(&url).await;
        assert!(matches!(result, Err(DerivError::Connection(_))));
    }
}
