//! In-process transport

use std::collections::HashMap;

use async_trait::async_trait;
use courier_shared::{frame, Frame};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::traits::{Transport, TransportError};
use crate::command::InboundProcessor;

/// Loopback transport that executes commands directly
///
/// A command frame is processed against the local executor registry on the
/// sending task, with no broker hop, and its result frame is handed to the
/// subscriber of the command's `reply_to`. Result frames go straight to the
/// subscriber of their destination.
pub struct LocalTransport {
    processor: InboundProcessor,
    sinks: Mutex<HashMap<String, mpsc::Sender<Frame>>>,
}

impl LocalTransport {
    pub fn new(processor: InboundProcessor) -> Self {
        Self {
            processor,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    async fn deliver(&self, destination: &str, frame: Frame) -> Result<(), TransportError> {
        let sink = self
            .sinks
            .lock()
            .get(destination)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(destination.to_string()))?;

        if sink.send(frame).await.is_err() {
            self.sinks.lock().remove(destination);
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn send(&self, destination: &str, frame: Frame) -> Result<(), TransportError> {
        match frame.body {
            Some(frame::Body::Command(envelope)) => {
                let result = self.processor.process(&envelope).await;
                self.deliver(&envelope.reply_to, Frame::result(result)).await
            }
            Some(body @ frame::Body::Result(_)) => {
                self.deliver(destination, Frame { body: Some(body) }).await
            }
            None => {
                debug!("Dropping empty frame for {}", destination);
                Ok(())
            }
        }
    }

    async fn subscribe(
        &self,
        channel: &str,
        sink: mpsc::Sender<Frame>,
    ) -> Result<(), TransportError> {
        self.sinks.lock().insert(channel.to_string(), sink);
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) {
        self.sinks.lock().remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_command, JsonCodec};
    use crate::command::{Command, CommandExecutor, ExecutorRegistry, TypeRegistry};
    use crate::error::ExecutorError;
    use async_trait::async_trait;
    use courier_shared::{now_ms, CommandEnvelope, OutcomeKind, ResultEnvelope};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    impl Command for Echo {
        const TYPE: &'static str = "echo";
    }

    struct EchoExecutor;

    #[async_trait]
    impl CommandExecutor for EchoExecutor {
        type Command = Echo;
        type Output = String;

        async fn execute(&self, command: Echo) -> Result<String, ExecutorError> {
            Ok(command.text)
        }
    }

    fn transport() -> LocalTransport {
        let types = Arc::new(TypeRegistry::new());
        let executors = Arc::new(ExecutorRegistry::default());
        types.register_command::<Echo>().expect("register");
        executors.add_executor(EchoExecutor).expect("bind");
        LocalTransport::new(InboundProcessor::new(
            types,
            executors,
            Arc::new(JsonCodec),
            "local",
            "local-1",
        ))
    }

    #[tokio::test]
    async fn test_command_result_reaches_reply_channel() {
        let transport = transport();
        let (tx, mut rx) = mpsc::channel(4);
        transport.subscribe("replies", tx).await.expect("subscribe");

        let envelope = CommandEnvelope {
            type_tag: "echo".into(),
            payload: encode_command(&JsonCodec, &Echo { text: "hi".into() }).expect("encode"),
            correlation_id: "c-7".into(),
            reply_to: "replies".into(),
            issued_at_ms: now_ms(),
            ..Default::default()
        };
        transport
            .send("anywhere", Frame::command(envelope))
            .await
            .expect("send");

        let frame = rx.recv().await.expect("result frame");
        match frame.body {
            Some(frame::Body::Result(result)) => {
                assert_eq!(result.correlation_id, "c-7");
                assert_eq!(result.outcome_kind(), OutcomeKind::Result);
                assert_eq!(result.payload, br#""hi""#);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_result_without_subscriber_is_unreachable() {
        let transport = transport();
        let frame = Frame::result(ResultEnvelope::success("c-1", "echo", Vec::new()));

        let err = transport.send("nobody", frame).await.expect_err("unreachable");
        assert!(matches!(err, TransportError::Unreachable(ref d) if d == "nobody"));
    }

    #[tokio::test]
    async fn test_closed_sink_is_dropped() {
        let transport = transport();
        let (tx, rx) = mpsc::channel(1);
        transport.subscribe("replies", tx).await.expect("subscribe");
        drop(rx);

        let frame = Frame::result(ResultEnvelope::success("c-1", "echo", Vec::new()));
        let err = transport.send("replies", frame).await.expect_err("closed");
        assert!(matches!(err, TransportError::Closed));
        assert!(transport.sinks.lock().is_empty());
    }
}
