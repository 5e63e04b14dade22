//! Broker-backed transport

use std::sync::Arc;

use async_trait::async_trait;
use courier_shared::codec;
use courier_shared::Frame;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::traits::{BrokerClient, Transport, TransportError};

/// Publishes frames through a `BrokerClient`
///
/// Every subscription runs its own delivery task that decodes bodies from
/// the broker and forwards them to the subscriber's sink. Bodies that do not
/// decode as a frame are republished to the error channel, if one is set.
pub struct BrokerTransport<B> {
    broker: Arc<B>,
    error_channel: Option<String>,
    /// Delivery task per subscribed channel
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl<B: BrokerClient> BrokerTransport<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self {
            broker,
            error_channel: None,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Forward undecodable deliveries to `channel`
    pub fn with_error_channel(mut self, channel: impl Into<String>) -> Self {
        self.error_channel = Some(channel.into());
        self
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }
}

#[async_trait]
impl<B: BrokerClient> Transport for BrokerTransport<B> {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn send(&self, destination: &str, frame: Frame) -> Result<(), TransportError> {
        let body = codec::encode_message(&frame)?;
        self.broker.publish(destination, body).await
    }

    async fn subscribe(
        &self,
        channel: &str,
        sink: mpsc::Sender<Frame>,
    ) -> Result<(), TransportError> {
        let mut deliveries = self.broker.consume(channel).await?;
        let broker = Arc::clone(&self.broker);
        let error_channel = self.error_channel.clone();
        let channel = channel.to_string();
        let name = channel.clone();

        let task = tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                let body = match delivery {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("Delivery error on {}: {}", channel, e);
                        continue;
                    }
                };

                match codec::decode_message::<Frame>(&body) {
                    Ok(frame) => {
                        if sink.send(frame).await.is_err() {
                            debug!("Subscriber of {} went away", channel);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Undecodable message on {}: {}", channel, e);
                        if let Some(error_channel) = &error_channel {
                            if let Err(e) = broker.publish(error_channel, body).await {
                                warn!("Failed to forward to {}: {}", error_channel, e);
                            }
                        }
                    }
                }
            }
            debug!("Delivery task for {} finished", channel);
        });

        self.tasks.lock().push((name, task));
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) {
        self.tasks.lock().retain(|(name, task)| {
            if name != channel {
                return true;
            }
            debug!("Stopping delivery task for {}", channel);
            task.abort();
            false
        });
    }
}

impl<B> Drop for BrokerTransport<B> {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;
    use bytes::Bytes;
    use courier_shared::{frame, CommandEnvelope};
    use futures::stream::BoxStream;
    use std::time::Duration;

    #[tokio::test]
    async fn test_frames_round_trip_through_broker() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = BrokerTransport::new(broker);
        let (tx, mut rx) = mpsc::channel(4);
        transport.subscribe("commands.app.com", tx).await.expect("subscribe");

        let envelope = CommandEnvelope {
            type_tag: "add_new_element".into(),
            correlation_id: "c-1".into(),
            ..Default::default()
        };
        transport
            .send("commands.app.com", Frame::command(envelope))
            .await
            .expect("send");

        let frame = rx.recv().await.expect("frame");
        match frame.body {
            Some(frame::Body::Command(cmd)) => assert_eq!(cmd.correlation_id, "c-1"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_broker_consumer() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = BrokerTransport::new(broker.clone());
        let (tx, _rx) = mpsc::channel(4);
        transport.subscribe("commands.app.com", tx).await.expect("subscribe");
        assert_eq!(broker.consumer_count("commands.app.com"), 1);

        transport.unsubscribe("commands.app.com");
        for _ in 0..100 {
            if broker.consumer_count("commands.app.com") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.consumer_count("commands.app.com"), 0);

        // With no consumer left the next body waits in the backlog
        let body = codec::encode_message(&Frame::command(CommandEnvelope::default())).expect("encode");
        broker.publish("commands.app.com", body).await.expect("publish");
        assert_eq!(broker.backlog_len("commands.app.com"), 1);
    }

    #[tokio::test]
    async fn test_garbage_goes_to_error_channel() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = BrokerTransport::new(broker.clone()).with_error_channel("commands.app.err");
        let (tx, mut rx) = mpsc::channel(4);
        transport.subscribe("commands.app.com", tx).await.expect("subscribe");

        // Field 1 with wire type 7 is not valid protobuf
        let garbage = Bytes::from_static(&[0x0f, 0xff, 0xff]);
        broker.publish("commands.app.com", garbage.clone()).await.expect("publish");

        let mut errors: BoxStream<'static, _> =
            broker.consume("commands.app.err").await.expect("consume");
        let forwarded = tokio::time::timeout(Duration::from_secs(1), errors.next())
            .await
            .expect("forwarded in time")
            .expect("stream open")
            .expect("delivery");
        assert_eq!(forwarded, garbage);
        assert!(rx.try_recv().is_err());
    }
}
