//! Courier: typed command dispatch
//!
//! Commands are routed by their type tag either to an executor in this
//! process or, through a transport, to another application. Remote calls
//! are correlated with their responses and bounded by a timeout.

pub mod codec;
pub mod command;
pub mod config;
pub mod correlation;
pub mod error;
pub mod service;
pub mod transport;

pub use command::{Command, CommandExecutor, CommandResult, Outcome};
pub use config::{CommandsConfig, Precedence};
pub use correlation::CorrelationId;
pub use error::{CommandError, ExecutorError};
pub use service::{CommandHandle, CommandsService, ExecuteOptions};
