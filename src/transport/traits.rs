//! Transport trait abstraction for pluggable delivery backends

use async_trait::async_trait;
use bytes::Bytes;
use courier_shared::codec::CodecError;
use courier_shared::Frame;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("no subscriber for destination `{0}`")]
    Unreachable(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Moves frames between services
///
/// `send` reports whether the frame was handed over, not whether it was
/// processed. Frames for a subscribed channel are pushed into the sink
/// until the sink's receiver is dropped or the channel is unsubscribed.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Human-readable name for this transport
    fn name(&self) -> &'static str;

    async fn send(&self, destination: &str, frame: Frame) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        channel: &str,
        sink: mpsc::Sender<Frame>,
    ) -> Result<(), TransportError>;

    /// Stop taking deliveries for `channel` so other consumers get them
    fn unsubscribe(&self, _channel: &str) {}
}

/// Raw message broker consumed by `BrokerTransport`
///
/// Delivery is at-least-once: consumers may see the same body more than once.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    async fn publish(&self, destination: &str, body: Bytes) -> Result<(), TransportError>;

    /// Lazy sequence of bodies published to `channel`
    async fn consume(
        &self,
        channel: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, TransportError>>, TransportError>;
}
