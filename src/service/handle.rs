//! Handles for asynchronously executed commands

use std::fmt;
use std::future::IntoFuture;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::command::Outcome;
use crate::correlation::{CorrelationId, PendingSlot};
use crate::error::CommandError;

enum Pending {
    /// Local executor running on its own task
    Local(LocalTask),
    /// Remote call waiting on its correlation slot
    Remote(PendingSlot),
}

/// Aborts the executor task when dropped
struct LocalTask(JoinHandle<Outcome>);

impl Drop for LocalTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Completion of a command started with `execute_async`
///
/// Await the handle (or call `wait`) to get the outcome. Completion order
/// between different handles is unspecified. Dropping a handle before it
/// completes cancels it.
pub struct CommandHandle {
    command_type: &'static str,
    pending: Pending,
}

impl CommandHandle {
    pub(crate) fn local(command_type: &'static str, task: JoinHandle<Outcome>) -> Self {
        Self {
            command_type,
            pending: Pending::Local(LocalTask(task)),
        }
    }

    pub(crate) fn remote(command_type: &'static str, slot: PendingSlot) -> Self {
        Self {
            command_type,
            pending: Pending::Remote(slot),
        }
    }

    pub fn command_type(&self) -> &'static str {
        self.command_type
    }

    /// Correlation id of a remote call; local calls never allocate one
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match &self.pending {
            Pending::Local(_) => None,
            Pending::Remote(slot) => Some(slot.id()),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.pending, Pending::Remote(_))
    }

    pub async fn wait(self) -> Outcome {
        match self.pending {
            Pending::Local(mut task) => match (&mut task.0).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => Err(CommandError::Cancelled),
                Err(e) => Err(CommandError::Executor(e.to_string())),
            },
            Pending::Remote(slot) => slot.wait().await,
        }
    }

    /// Stop waiting for the outcome
    ///
    /// A remote executor may still process the command; its response is
    /// discarded when it arrives.
    pub fn cancel(self) {
        match self.pending {
            Pending::Local(task) => drop(task),
            Pending::Remote(slot) => slot.cancel(),
        }
    }
}

impl IntoFuture for CommandHandle {
    type Output = Outcome;
    type IntoFuture = BoxFuture<'static, Outcome>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHandle")
            .field("command_type", &self.command_type)
            .field("correlation_id", &self.correlation_id())
            .finish()
    }
}
