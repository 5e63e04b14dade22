//! Execution of command envelopes addressed to this process

use std::sync::Arc;

use courier_shared::{now_ms, CommandEnvelope, ResultEnvelope};
use tracing::{debug, warn};

use super::executor::ExecutorRegistry;
use super::registry::TypeRegistry;
use crate::codec::{decode_command, PayloadCodec};
use crate::error::CommandError;

/// Decodes, executes and answers inbound command envelopes
#[derive(Clone)]
pub struct InboundProcessor {
    types: Arc<TypeRegistry>,
    executors: Arc<ExecutorRegistry>,
    codec: Arc<dyn PayloadCodec>,
    app_name: String,
    app_instance_id: String,
}

impl InboundProcessor {
    pub fn new(
        types: Arc<TypeRegistry>,
        executors: Arc<ExecutorRegistry>,
        codec: Arc<dyn PayloadCodec>,
        app_name: impl Into<String>,
        app_instance_id: impl Into<String>,
    ) -> Self {
        Self {
            types,
            executors,
            codec,
            app_name: app_name.into(),
            app_instance_id: app_instance_id.into(),
        }
    }

    /// Execute `envelope` and build the result envelope for its `reply_to`
    pub async fn process(&self, envelope: &CommandEnvelope) -> ResultEnvelope {
        let started = now_ms();

        debug!(
            "Executing command: id={} type={} from={}",
            envelope.correlation_id, envelope.type_tag, envelope.source_app
        );

        let mut result = match self.execute(envelope).await {
            Ok(payload) => {
                ResultEnvelope::success(&envelope.correlation_id, &envelope.type_tag, payload)
            }
            Err(e) => {
                warn!(
                    "Command {} ({}) failed: {}",
                    envelope.correlation_id, envelope.type_tag, e
                );
                ResultEnvelope::failure(
                    &envelope.correlation_id,
                    &envelope.type_tag,
                    e.code().as_str(),
                    e.wire_message(),
                )
            }
        };

        result.started_at_ms = started;
        result.completed_at_ms = now_ms();
        result.app_name = self.app_name.clone();
        result.app_instance_id = self.app_instance_id.clone();
        result
    }

    async fn execute(&self, envelope: &CommandEnvelope) -> Result<Vec<u8>, CommandError> {
        if envelope.is_expired() {
            return Err(CommandError::Expired);
        }

        let tag = &envelope.type_tag;
        let shape = self.types.resolve(tag);

        // Remote bindings are not followed here: an inbound command is never forwarded again
        let value = match (shape, self.executors.local(tag)) {
            (Ok(shape), Some(executor)) => {
                let command = decode_command(self.codec.as_ref(), &envelope.payload, &shape)?;
                executor.execute(command).await?
            }
            (shape, _) => {
                let Some(fallback) = self.executors.fallback() else {
                    shape?;
                    return Err(CommandError::NoExecutor(tag.clone()));
                };
                let body = self.codec.decode(&envelope.payload)?;
                fallback.execute(tag, body).await?
            }
        };
        self.codec.encode(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_command, JsonCodec};
    use crate::command::{Command, CommandExecutor, FallbackExecutor};
    use crate::error::ExecutorError;
    use async_trait::async_trait;
    use courier_shared::OutcomeKind;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Double {
        n: i64,
    }

    impl Command for Double {
        const TYPE: &'static str = "double";
    }

    struct DoubleExecutor;

    #[async_trait]
    impl CommandExecutor for DoubleExecutor {
        type Command = Double;
        type Output = i64;

        async fn execute(&self, command: Double) -> Result<i64, ExecutorError> {
            if command.n < 0 {
                return Err(ExecutorError::new("negative input"));
            }
            Ok(command.n * 2)
        }
    }

    fn processor() -> InboundProcessor {
        let types = Arc::new(TypeRegistry::new());
        let executors = Arc::new(ExecutorRegistry::default());
        types.register_command::<Double>().expect("register");
        executors.add_executor(DoubleExecutor).expect("bind");
        InboundProcessor::new(types, executors, Arc::new(JsonCodec), "math", "math-1")
    }

    fn envelope(n: i64) -> CommandEnvelope {
        CommandEnvelope {
            type_tag: "double".into(),
            payload: encode_command(&JsonCodec, &Double { n }).expect("encode"),
            correlation_id: "c-1".into(),
            reply_to: "commands.caller.res.1".into(),
            issued_at_ms: now_ms(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_success_envelope() {
        let result = processor().process(&envelope(21)).await;

        assert_eq!(result.outcome_kind(), OutcomeKind::Result);
        assert_eq!(result.correlation_id, "c-1");
        assert_eq!(result.payload, b"42");
        assert_eq!(result.app_name, "math");
        assert!(result.completed_at_ms >= result.started_at_ms);
    }

    #[tokio::test]
    async fn test_executor_failure_envelope() {
        let result = processor().process(&envelope(-1)).await;

        assert_eq!(result.outcome_kind(), OutcomeKind::Failure);
        assert_eq!(result.error_code, "executor");
        assert_eq!(result.error_message, "negative input");
    }

    #[tokio::test]
    async fn test_unknown_type_envelope() {
        let mut env = envelope(1);
        env.type_tag = "triple".into();
        let result = processor().process(&env).await;

        assert_eq!(result.error_code, "unknown_type");
        assert_eq!(result.error_message, "triple");
    }

    /// Answers any tag with the tag and the raw body it received
    struct CatchAll;

    #[async_trait]
    impl FallbackExecutor for CatchAll {
        async fn execute(
            &self,
            type_tag: &str,
            body: serde_json::Value,
        ) -> Result<serde_json::Value, ExecutorError> {
            Ok(serde_json::json!([type_tag, body]))
        }
    }

    #[tokio::test]
    async fn test_fallback_serves_unregistered_tags() {
        let processor = processor();
        processor.executors.set_fallback(CatchAll).expect("bind");

        for tag in ["custom-type", "other command type"] {
            let mut env = envelope(5);
            env.type_tag = tag.into();
            let result = processor.process(&env).await;

            assert_eq!(result.outcome_kind(), OutcomeKind::Result, "{tag}");
            let value: serde_json::Value = serde_json::from_slice(&result.payload).expect("json");
            assert_eq!(value, serde_json::json!([tag, {"n": 5}]));
        }

        // Typed bindings still take precedence
        let result = processor.process(&envelope(21)).await;
        assert_eq!(result.payload, b"42");
    }

    #[tokio::test]
    async fn test_expired_envelope_is_not_executed() {
        let mut env = envelope(1);
        env.issued_at_ms = now_ms() - 10_000;
        env.ttl_ms = 1_000;
        let result = processor().process(&env).await;

        assert_eq!(result.error_code, "expired");
    }
}
