//! TCP broker client for `courier-relay`
//!
//! Holds one persistent connection to the relay and reconnects with
//! exponential backoff. Subscriptions survive reconnects: every channel
//! consumed through this client is subscribed again on each new connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_shared::codec::{self, FrameDecoder};
use courier_shared::{relay_message, RelayMessage};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::traits::{BrokerClient, TransportError};

type Subscriptions = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>>;

/// Configuration for the relay connection
#[derive(Debug, Clone)]
pub struct TcpBrokerConfig {
    /// Relay address
    pub address: String,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Messages buffered while the relay is unreachable
    pub outbound_capacity: usize,
}

impl Default for TcpBrokerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7070".into(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            outbound_capacity: 1024,
        }
    }
}

/// `BrokerClient` speaking the relay protocol over TCP
pub struct TcpBrokerClient {
    outbound_tx: mpsc::Sender<RelayMessage>,
    subscriptions: Subscriptions,
    task: JoinHandle<()>,
}

impl TcpBrokerClient {
    /// Create the client and start the connection loop
    pub fn connect(config: TcpBrokerConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));

        let subs = subscriptions.clone();
        let task = tokio::spawn(async move {
            connection_loop(config, outbound_rx, subs).await;
        });

        Self {
            outbound_tx,
            subscriptions,
            task,
        }
    }
}

impl Drop for TcpBrokerClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl BrokerClient for TcpBrokerClient {
    async fn publish(&self, destination: &str, body: Bytes) -> Result<(), TransportError> {
        self.outbound_tx
            .send(RelayMessage::publish(destination, body.to_vec()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn consume(
        &self,
        channel: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, TransportError>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self
            .subscriptions
            .lock()
            .insert(channel.to_string(), tx)
            .is_some()
        {
            debug!("Replacing consumer of {}", channel);
        }

        self.outbound_tx
            .send(RelayMessage::subscribe(channel))
            .await
            .map_err(|_| TransportError::Closed)?;

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|body| (Ok(body), rx))
        });
        Ok(stream.boxed())
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    config: TcpBrokerConfig,
    mut outbound_rx: mpsc::Receiver<RelayMessage>,
    subscriptions: Subscriptions,
) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match timeout(config.connect_timeout, TcpStream::connect(&config.address)).await {
            Ok(Ok(stream)) => {
                reconnect_delay = config.reconnect_delay;
                info!("Connected to relay at {}", config.address);

                match handle_connection(stream, &mut outbound_rx, &subscriptions).await {
                    Ok(()) => {
                        debug!("Broker client dropped, closing relay connection");
                        return;
                    }
                    Err(e) => warn!("Relay connection lost: {}", e),
                }
            }
            Ok(Err(e)) => {
                warn!("Failed to connect to relay at {}: {}", config.address, e);
            }
            Err(_) => {
                warn!("Timed out connecting to relay at {}", config.address);
            }
        }

        tokio::time::sleep(reconnect_delay).await;

        // Exponential backoff
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }
}

/// Handle an active connection
///
/// Returns `Ok(())` once the client is dropped and nothing is left to send.
async fn handle_connection(
    stream: TcpStream,
    outbound_rx: &mut mpsc::Receiver<RelayMessage>,
    subscriptions: &Subscriptions,
) -> Result<(), TransportError> {
    let (mut reader, mut writer) = stream.into_split();

    let channels: Vec<String> = subscriptions.lock().keys().cloned().collect();
    for channel in channels {
        let encoded = codec::encode(&RelayMessage::subscribe(channel))?;
        writer.write_all(&encoded).await?;
    }

    let mut decoder = FrameDecoder::<RelayMessage>::new();
    let mut read_buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    return Ok(());
                };
                let encoded = codec::encode(&message)?;
                writer.write_all(&encoded).await?;
            }

            read = reader.read(&mut read_buf) => {
                let n = read?;
                if n == 0 {
                    return Err(TransportError::Connection("relay closed connection".into()));
                }
                decoder.extend(&read_buf[..n]);

                while let Some(message) = decoder.decode_next()? {
                    dispatch(message, subscriptions);
                }
            }
        }
    }
}

fn dispatch(message: RelayMessage, subscriptions: &Subscriptions) {
    match message.kind {
        Some(relay_message::Kind::Deliver(deliver)) => {
            let mut subs = subscriptions.lock();
            let delivered = subs
                .get(&deliver.channel)
                .map(|tx| tx.send(Bytes::from(deliver.body)).is_ok());
            match delivered {
                Some(true) => {}
                Some(false) => {
                    debug!("Consumer of {} is gone", deliver.channel);
                    subs.remove(&deliver.channel);
                }
                None => debug!("Delivery for unknown channel {}", deliver.channel),
            }
        }
        other => debug!("Ignoring relay message: {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn read_message(
        socket: &mut TcpStream,
        decoder: &mut FrameDecoder<RelayMessage>,
    ) -> RelayMessage {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(message) = decoder.decode_next().expect("decode") {
                return message;
            }
            let n = socket.read(&mut buf).await.expect("read");
            assert!(n > 0, "client closed");
            decoder.extend(&buf[..n]);
        }
    }

    #[test]
    fn test_default_config() {
        let config = TcpBrokerConfig::default();
        assert_eq!(config.address, "127.0.0.1:7070");
        assert!(config.reconnect_delay < config.max_reconnect_delay);
    }

    #[tokio::test]
    async fn test_subscribe_publish_and_deliver() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();

        let client = TcpBrokerClient::connect(TcpBrokerConfig {
            address,
            ..Default::default()
        });
        let mut deliveries = client.consume("commands.app.com").await.expect("consume");
        client
            .publish("commands.other.com", Bytes::from_static(b"out"))
            .await
            .expect("publish");

        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut decoder = FrameDecoder::new();

        let mut saw_subscribe = false;
        let mut saw_publish = false;
        while !(saw_subscribe && saw_publish) {
            match read_message(&mut socket, &mut decoder).await.kind {
                Some(relay_message::Kind::Subscribe(s)) => {
                    assert_eq!(s.channel, "commands.app.com");
                    saw_subscribe = true;
                }
                Some(relay_message::Kind::Publish(p)) => {
                    assert_eq!(p.destination, "commands.other.com");
                    assert_eq!(p.body, b"out");
                    saw_publish = true;
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }

        let deliver = codec::encode(&RelayMessage::deliver("commands.app.com", b"in".to_vec()))
            .expect("encode");
        socket.write_all(&deliver).await.expect("write");

        let body = deliveries.next().await.expect("open").expect("delivery");
        assert_eq!(body, Bytes::from_static(b"in"));
    }
}
