//! Courier Shared Protocol Types
//!
//! This crate provides the wire envelopes, framing codec and destination
//! naming shared by courier nodes and the relay.

pub mod codec;
pub mod destinations;
pub mod proto;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use proto::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default tuning parameters
pub mod defaults {
    /// Per-call wait bound for remote commands
    pub const COMMAND_TIMEOUT_MS: u64 = 60_000;

    /// Inbound commands executed concurrently per node
    pub const CONCURRENT_CONSUMERS: usize = 4;

    /// Pending slot count above which a leak warning is logged
    pub const PENDING_WARN_THRESHOLD: usize = 10_000;

    /// Interval of the timeout sweeper
    pub const SWEEP_INTERVAL_MS: u64 = 1000;

    /// Messages buffered by the relay for a channel nobody consumes yet
    pub const RELAY_BACKLOG_LIMIT: usize = 10_000;
}

impl CommandEnvelope {
    /// Check if this command has outlived its TTL
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        if self.ttl_ms == 0 {
            return false; // No expiry set
        }
        now_ms > self.issued_at_ms.saturating_add(self.ttl_ms)
    }
}

impl ResultEnvelope {
    /// Create a result envelope carrying an encoded value
    pub fn success(
        correlation_id: impl Into<String>,
        type_tag: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            type_tag: type_tag.into(),
            outcome: OutcomeKind::Result.into(),
            payload,
            ..Default::default()
        }
    }

    /// Create a result envelope carrying an error code and message
    pub fn failure(
        correlation_id: impl Into<String>,
        type_tag: impl Into<String>,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            type_tag: type_tag.into(),
            outcome: OutcomeKind::Failure.into(),
            error_code: error_code.into(),
            error_message: error_message.into(),
            ..Default::default()
        }
    }

    /// Decoded outcome kind, `Unspecified` for unknown values
    pub fn outcome_kind(&self) -> OutcomeKind {
        OutcomeKind::try_from(self.outcome).unwrap_or(OutcomeKind::Unspecified)
    }
}

impl Frame {
    pub fn command(envelope: CommandEnvelope) -> Self {
        Self {
            body: Some(frame::Body::Command(envelope)),
        }
    }

    pub fn result(envelope: ResultEnvelope) -> Self {
        Self {
            body: Some(frame::Body::Result(envelope)),
        }
    }

    /// Correlation id carried by either body kind
    pub fn correlation_id(&self) -> Option<&str> {
        match &self.body {
            Some(frame::Body::Command(c)) => Some(&c.correlation_id),
            Some(frame::Body::Result(r)) => Some(&r.correlation_id),
            None => None,
        }
    }
}

impl RelayMessage {
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self {
            kind: Some(relay_message::Kind::Subscribe(relay_message::Subscribe {
                channel: channel.into(),
            })),
        }
    }

    pub fn publish(destination: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            kind: Some(relay_message::Kind::Publish(relay_message::Publish {
                destination: destination.into(),
                body,
            })),
        }
    }

    pub fn deliver(channel: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            kind: Some(relay_message::Kind::Deliver(relay_message::Deliver {
                channel: channel.into(),
                body,
            })),
        }
    }
}
