//! Command outcomes

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::correlation::CorrelationId;
use crate::error::CommandError;

/// Result of command execution
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    /// Tag of the executed command
    pub command_type: String,
    /// Set when the command went through the correlation path
    pub correlation_id: Option<CorrelationId>,
    pub started_ms: u64,
    pub completed_ms: u64,
    /// Application that executed the command
    pub app_name: String,
    pub app_instance_id: String,
    /// Value returned by the executor (`Null` for unit results)
    pub value: Value,
}

impl CommandResult {
    /// Convert the executor's value into `T`
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T, CommandError> {
        Ok(serde_json::from_value(self.value.clone())?)
    }

    /// Wall-clock processing time reported by the executing side
    pub fn processing_time_ms(&self) -> u64 {
        self.completed_ms.saturating_sub(self.started_ms)
    }

    /// True when the result came back through a transport
    pub fn is_remote(&self) -> bool {
        self.correlation_id.is_some()
    }
}

/// What a pending slot resolves to
pub type Outcome = Result<CommandResult, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct AddResult {
        value: String,
    }

    fn result_with(value: Value) -> CommandResult {
        CommandResult {
            command_type: "add_new_element".into(),
            correlation_id: None,
            started_ms: 100,
            completed_ms: 130,
            app_name: "app".into(),
            app_instance_id: "app-1".into(),
            value,
        }
    }

    #[test]
    fn test_value_as() {
        let result = result_with(serde_json::json!({"value": "test-elem"}));
        let typed: AddResult = result.value_as().expect("typed value");
        assert_eq!(typed.value, "test-elem");
        assert_eq!(result.processing_time_ms(), 30);
        assert!(!result.is_remote());
    }

    #[test]
    fn test_value_as_wrong_shape() {
        let result = result_with(Value::Null);
        assert!(matches!(result.value_as::<AddResult>(), Err(CommandError::Codec(_))));
    }
}
