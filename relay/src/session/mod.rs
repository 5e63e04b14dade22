//! Session management for connected courier nodes
//!
//! This module handles:
//! - Reading relay messages from each node connection
//! - Tracking channel subscriptions per session
//! - Routing published bodies to one subscriber per channel

mod connection;
mod manager;

pub use connection::{RelaySession, SessionHandle};
pub use manager::{Routed, Router};
