//! Wire messages exchanged between courier nodes and the relay.
//!
//! Declared directly with the prost derives so the crate has no build step.

use prost::{Enumeration, Message};

/// A command on its way to the process that will execute it.
#[derive(Clone, PartialEq, Message)]
pub struct CommandEnvelope {
    /// Type tag of the command payload
    #[prost(string, tag = "1")]
    pub type_tag: String,

    /// Codec-encoded command payload
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,

    /// Correlation id of the waiting caller
    #[prost(string, tag = "3")]
    pub correlation_id: String,

    /// Channel the result envelope must be published to
    #[prost(string, tag = "4")]
    pub reply_to: String,

    #[prost(uint64, tag = "5")]
    pub issued_at_ms: u64,

    /// Time to live in milliseconds, 0 means no expiry
    #[prost(uint64, tag = "6")]
    pub ttl_ms: u64,

    #[prost(string, tag = "7")]
    pub source_app: String,

    #[prost(string, tag = "8")]
    pub source_app_id: String,

    #[prost(string, tag = "9")]
    pub target_app: String,

    #[prost(string, tag = "10")]
    pub user: String,

    #[prost(string, tag = "11")]
    pub tenant: String,
}

/// Outcome of a command, addressed back to the issuing process.
#[derive(Clone, PartialEq, Message)]
pub struct ResultEnvelope {
    #[prost(string, tag = "1")]
    pub correlation_id: String,

    #[prost(string, tag = "2")]
    pub type_tag: String,

    #[prost(enumeration = "OutcomeKind", tag = "3")]
    pub outcome: i32,

    /// Codec-encoded result value (only for `OutcomeKind::Result`)
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,

    /// Error taxonomy code (only for `OutcomeKind::Failure`)
    #[prost(string, tag = "5")]
    pub error_code: String,

    #[prost(string, tag = "6")]
    pub error_message: String,

    #[prost(uint64, tag = "7")]
    pub started_at_ms: u64,

    #[prost(uint64, tag = "8")]
    pub completed_at_ms: u64,

    /// Application that executed the command
    #[prost(string, tag = "9")]
    pub app_name: String,

    #[prost(string, tag = "10")]
    pub app_instance_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum OutcomeKind {
    Unspecified = 0,
    Result = 1,
    Failure = 2,
}

/// Unit of delivery between transports.
#[derive(Clone, PartialEq, Message)]
pub struct Frame {
    #[prost(oneof = "frame::Body", tags = "1, 2")]
    pub body: Option<frame::Body>,
}

pub mod frame {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Command(super::CommandEnvelope),
        #[prost(message, tag = "2")]
        Result(super::ResultEnvelope),
    }
}

/// Client <-> relay protocol.
#[derive(Clone, PartialEq, Message)]
pub struct RelayMessage {
    #[prost(oneof = "relay_message::Kind", tags = "1, 2, 3")]
    pub kind: Option<relay_message::Kind>,
}

pub mod relay_message {
    use prost::{Message, Oneof};

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Subscribe(Subscribe),
        #[prost(message, tag = "2")]
        Publish(Publish),
        #[prost(message, tag = "3")]
        Deliver(Deliver),
    }

    /// Start consuming a channel
    #[derive(Clone, PartialEq, Message)]
    pub struct Subscribe {
        #[prost(string, tag = "1")]
        pub channel: String,
    }

    /// Publish a body to one consumer of `destination`
    #[derive(Clone, PartialEq, Message)]
    pub struct Publish {
        #[prost(string, tag = "1")]
        pub destination: String,
        #[prost(bytes = "vec", tag = "2")]
        pub body: Vec<u8>,
    }

    /// Relay -> client delivery on a subscribed channel
    #[derive(Clone, PartialEq, Message)]
    pub struct Deliver {
        #[prost(string, tag = "1")]
        pub channel: String,
        #[prost(bytes = "vec", tag = "2")]
        pub body: Vec<u8>,
    }
}
