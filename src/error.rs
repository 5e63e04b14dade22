//! Error taxonomy for command dispatch.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Every failure a caller of the commands service can observe.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command shape carries no type tag.
    #[error("command `{0}` does not declare a type tag")]
    UntaggedCommand(String),

    /// The tag was never registered in the type registry.
    #[error("unknown command type: {0}")]
    UnknownType(String),

    /// The tag is already bound to a different command shape.
    #[error("command type `{tag}` is already bound to `{existing}`")]
    DuplicateType {
        /// The contested tag.
        tag: String,
        /// Rust type name of the shape already registered.
        existing: String,
    },

    /// The executor registry rejects rebinding under `BindingPolicy::Reject`.
    #[error("executor already bound for command type: {0}")]
    ExecutorAlreadyBound(String),

    /// Neither a local executor nor a remote destination handles the tag.
    #[error("no executor found for command type: {0}")]
    NoExecutor(String),

    /// Sending or subscribing through the transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// No outcome arrived within the wait bound.
    #[error("command `{command_type}` timed out after {timeout:?}")]
    Timeout {
        command_type: String,
        timeout: Duration,
    },

    /// The caller abandoned the call.
    #[error("command was cancelled")]
    Cancelled,

    /// The executor failed while processing the command.
    #[error("executor failed: {0}")]
    Executor(String),

    /// Payload or result could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The command outlived its TTL before it was executed.
    #[error("command expired before execution")]
    Expired,

    /// A failure reported by a remote process with a code this process does not know.
    #[error("remote failure [{code}]: {message}")]
    Remote { code: String, message: String },
}

/// Stable wire codes for `CommandError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    UntaggedCommand,
    UnknownType,
    DuplicateType,
    ExecutorAlreadyBound,
    NoExecutor,
    Transport,
    Timeout,
    Cancelled,
    Executor,
    Codec,
    Expired,
    Remote,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UntaggedCommand => "untagged_command",
            ErrorCode::UnknownType => "unknown_type",
            ErrorCode::DuplicateType => "duplicate_type",
            ErrorCode::ExecutorAlreadyBound => "executor_already_bound",
            ErrorCode::NoExecutor => "no_executor",
            ErrorCode::Transport => "transport",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Executor => "executor",
            ErrorCode::Codec => "codec",
            ErrorCode::Expired => "expired",
            ErrorCode::Remote => "remote",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        let code = match code {
            "untagged_command" => ErrorCode::UntaggedCommand,
            "unknown_type" => ErrorCode::UnknownType,
            "duplicate_type" => ErrorCode::DuplicateType,
            "executor_already_bound" => ErrorCode::ExecutorAlreadyBound,
            "no_executor" => ErrorCode::NoExecutor,
            "transport" => ErrorCode::Transport,
            "timeout" => ErrorCode::Timeout,
            "cancelled" => ErrorCode::Cancelled,
            "executor" => ErrorCode::Executor,
            "codec" => ErrorCode::Codec,
            "expired" => ErrorCode::Expired,
            "remote" => ErrorCode::Remote,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CommandError::UntaggedCommand(_) => ErrorCode::UntaggedCommand,
            CommandError::UnknownType(_) => ErrorCode::UnknownType,
            CommandError::DuplicateType { .. } => ErrorCode::DuplicateType,
            CommandError::ExecutorAlreadyBound(_) => ErrorCode::ExecutorAlreadyBound,
            CommandError::NoExecutor(_) => ErrorCode::NoExecutor,
            CommandError::Transport(_) => ErrorCode::Transport,
            CommandError::Timeout { .. } => ErrorCode::Timeout,
            CommandError::Cancelled => ErrorCode::Cancelled,
            CommandError::Executor(_) => ErrorCode::Executor,
            CommandError::Codec(_) => ErrorCode::Codec,
            CommandError::Expired => ErrorCode::Expired,
            CommandError::Remote { .. } => ErrorCode::Remote,
        }
    }

    /// Diagnostic text sent alongside the code in a failure envelope.
    pub fn wire_message(&self) -> String {
        match self {
            CommandError::UntaggedCommand(s)
            | CommandError::UnknownType(s)
            | CommandError::ExecutorAlreadyBound(s)
            | CommandError::NoExecutor(s)
            | CommandError::Transport(s)
            | CommandError::Executor(s)
            | CommandError::Codec(s) => s.clone(),
            CommandError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild the typed error from a failure envelope.
    ///
    /// Codes that only make sense locally (timeouts, cancellation, registry
    /// conflicts) and unknown codes come back as `Remote`.
    pub fn from_wire(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match ErrorCode::parse(code) {
            Some(ErrorCode::UntaggedCommand) => CommandError::UntaggedCommand(message),
            Some(ErrorCode::UnknownType) => CommandError::UnknownType(message),
            Some(ErrorCode::NoExecutor) => CommandError::NoExecutor(message),
            Some(ErrorCode::Transport) => CommandError::Transport(message),
            Some(ErrorCode::Executor) => CommandError::Executor(message),
            Some(ErrorCode::Codec) => CommandError::Codec(message),
            Some(ErrorCode::Expired) => CommandError::Expired,
            _ => CommandError::Remote {
                code: code.to_string(),
                message,
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }
}

impl From<TransportError> for CommandError {
    fn from(e: TransportError) -> Self {
        CommandError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        CommandError::Codec(e.to_string())
    }
}

/// Failure returned by an executor's `execute`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for ExecutorError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ExecutorError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for ExecutorError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_parse_back() {
        for code in [
            ErrorCode::UntaggedCommand,
            ErrorCode::UnknownType,
            ErrorCode::NoExecutor,
            ErrorCode::Executor,
            ErrorCode::Expired,
            ErrorCode::Remote,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("nope"), None);
    }

    #[test]
    fn test_from_wire_rebuilds_typed_errors() {
        let e = CommandError::from_wire("executor", "EX_TEST TEST MSG");
        assert!(matches!(&e, CommandError::Executor(m) if m == "EX_TEST TEST MSG"));

        let e = CommandError::from_wire("no_executor", "add_new_element");
        assert!(matches!(&e, CommandError::NoExecutor(t) if t == "add_new_element"));

        let e = CommandError::from_wire("expired", "whatever");
        assert!(matches!(e, CommandError::Expired));
    }

    #[test]
    fn test_unknown_code_becomes_remote() {
        let e = CommandError::from_wire("quota_exceeded", "too many");
        assert_eq!(e.code(), ErrorCode::Remote);
        assert_eq!(e.wire_message(), "too many");
    }

    #[test]
    fn test_wire_message_round_trip() {
        let original = CommandError::Executor("disk full".into());
        let rebuilt = CommandError::from_wire(original.code().as_str(), original.wire_message());
        assert_eq!(rebuilt.to_string(), original.to_string());
    }
}
