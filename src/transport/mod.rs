//! Duplex message channel consumed by the connection manager.
//!
//! `Transport::open` yields a [`TransportLink`]: a sink for outbound text
//! frames and a receiver of [`TransportEvent`]s. Dropping the receiver or
//! calling [`FrameSink::close`] tears the link down.

#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod websocket;

#[cfg(any(test, feature = "testing"))]
pub use mock::{MockTransport, ScriptedBroker};
pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use crate::error::Result;

/// Inbound events emitted by an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame
    Frame(String),
    /// Peer closed the link, with an optional reason
    Closed(Option<String>),
    /// Link failed
    Error(String),
}

/// Outbound half of an open link
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one text frame; an error means the link is unusable
    async fn send(&self, frame: String) -> Result<()>;

    /// Close the link cleanly
    async fn close(&self) -> Result<()>;
}

/// An open link
pub struct TransportLink {
    pub sink: Arc<dyn FrameSink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens links to the broker endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &Url) -> Result<TransportLink>;
}
