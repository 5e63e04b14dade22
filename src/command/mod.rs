//! Command registration and execution infrastructure
//!
//! This module handles:
//! - Mapping type tags to command shapes (type registry)
//! - Binding type tags to local or remote executors
//! - Executing command envelopes that arrive from a transport

mod executor;
mod inbound;
mod registry;
mod result;

pub use executor::{
    BindingPolicy, CommandExecutor, ExecutorBinding, ExecutorRegistry, FallbackExecutor,
    FallbackHandle, LocalExecutor,
};
pub use inbound::InboundProcessor;
pub use registry::{tag_of, Command, ShapeDescriptor, TypeRegistry};
pub use result::{CommandResult, Outcome};
