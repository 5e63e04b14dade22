//! Pending slot table for in-flight remote calls
//!
//! Every remote call owns one slot keyed by a fresh correlation id. A slot
//! moves `Waiting -> Resolved | TimedOut | Cancelled` exactly once: whoever
//! removes the entry from the table first wins, later `resolve` calls for
//! the same id are silently discarded.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::command::Outcome;
use crate::error::CommandError;

/// Unique token linking a request to its eventual response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle of a pending slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Waiting,
    Resolved,
    TimedOut,
    Cancelled,
}

struct SlotEntry {
    sender: oneshot::Sender<Outcome>,
    command_type: String,
    timeout: Duration,
    deadline: Instant,
}

/// Counters for slot transitions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub allocated: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Duplicate or late resolutions that found no waiting slot
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    allocated: AtomicU64,
    resolved: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    discarded: AtomicU64,
}

/// Tracks every outstanding remote call
pub struct CorrelationManager {
    slots: Mutex<HashMap<CorrelationId, SlotEntry>>,
    counters: Counters,
    warn_threshold: usize,
}

impl CorrelationManager {
    /// Create a new correlation manager
    pub fn new(warn_threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            warn_threshold,
        })
    }

    /// Allocate a fresh id and a waiting slot bounded by `timeout`
    pub fn begin(self: &Arc<Self>, command_type: &str, timeout: Duration) -> PendingSlot {
        let id = CorrelationId::new();
        let deadline = Instant::now() + timeout;
        let (sender, receiver) = oneshot::channel();

        let pending = {
            let mut slots = self.slots.lock();
            slots.insert(
                id,
                SlotEntry {
                    sender,
                    command_type: command_type.to_string(),
                    timeout,
                    deadline,
                },
            );
            slots.len()
        };
        self.counters.allocated.fetch_add(1, Ordering::Relaxed);

        if pending > self.warn_threshold {
            warn!(
                "Pending commands table is too big, potential leak. Size: {}",
                pending
            );
        }

        PendingSlot {
            id,
            command_type: command_type.to_string(),
            timeout,
            deadline,
            receiver,
            manager: Arc::clone(self),
            state: SlotState::Waiting,
        }
    }

    /// Deliver `outcome` to the slot waiting on `id`
    ///
    /// Returns `true` if this call resolved the slot. Duplicate deliveries and
    /// responses arriving after a timeout or cancellation return `false`.
    pub fn resolve(&self, id: &CorrelationId, outcome: Outcome) -> bool {
        let entry = self.slots.lock().remove(id);
        match entry {
            Some(entry) => {
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                if entry.sender.send(outcome).is_err() {
                    debug!("Waiter for {} ({}) is gone", id, entry.command_type);
                }
                true
            }
            None => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping late or duplicate outcome for {}", id);
                false
            }
        }
    }

    /// Time out every slot whose deadline has passed
    ///
    /// Waiters of expired slots observe `CommandError::Timeout`.
    pub fn expire_overdue(&self) -> Vec<CorrelationId> {
        let now = Instant::now();
        let expired: Vec<(CorrelationId, SlotEntry)> = {
            let mut slots = self.slots.lock();
            let ids: Vec<CorrelationId> = slots
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| slots.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in &expired {
            debug!("Command {} ({}) expired", id, entry.command_type);
        }
        self.counters
            .timed_out
            .fetch_add(expired.len() as u64, Ordering::Relaxed);

        expired
            .into_iter()
            .map(|(id, entry)| {
                let _ = entry.sender.send(Err(CommandError::Timeout {
                    command_type: entry.command_type,
                    timeout: entry.timeout,
                }));
                id
            })
            .collect()
    }

    /// Number of slots still waiting
    pub fn in_flight(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.slots.lock().contains_key(id)
    }

    pub fn stats(&self) -> CorrelationStats {
        CorrelationStats {
            allocated: self.counters.allocated.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    /// Remove a slot on the waiter's behalf; `true` if it was still waiting
    fn withdraw(&self, id: &CorrelationId) -> bool {
        self.slots.lock().remove(id).is_some()
    }
}

impl fmt::Debug for CorrelationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationManager")
            .field("in_flight", &self.in_flight())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Caller side of one outstanding call
///
/// Dropping a slot that is still waiting cancels it.
pub struct PendingSlot {
    id: CorrelationId,
    command_type: String,
    timeout: Duration,
    deadline: Instant,
    receiver: oneshot::Receiver<Outcome>,
    manager: Arc<CorrelationManager>,
    state: SlotState,
}

impl PendingSlot {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Wait for the outcome until the slot's deadline
    pub async fn wait(mut self) -> Outcome {
        match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(outcome)) => {
                self.state = match &outcome {
                    Err(CommandError::Timeout { .. }) => SlotState::TimedOut,
                    _ => SlotState::Resolved,
                };
                outcome
            }
            Ok(Err(_)) => {
                // Sender dropped without an outcome
                self.state = SlotState::Cancelled;
                Err(CommandError::Cancelled)
            }
            Err(_) => {
                if self.manager.withdraw(&self.id) {
                    self.manager
                        .counters
                        .timed_out
                        .fetch_add(1, Ordering::Relaxed);
                    self.state = SlotState::TimedOut;
                    debug!("Command {} ({}) timed out", self.id, self.command_type);
                    return Err(self.timeout_error());
                }

                // Whoever removed the entry sends or drops right after unlocking
                match (&mut self.receiver).await {
                    Ok(outcome) => {
                        self.state = match &outcome {
                            Err(CommandError::Timeout { .. }) => SlotState::TimedOut,
                            _ => SlotState::Resolved,
                        };
                        outcome
                    }
                    Err(_) => {
                        self.state = SlotState::TimedOut;
                        Err(self.timeout_error())
                    }
                }
            }
        }
    }

    /// Give up on the call before a response could arrive
    ///
    /// Counts as a timeout; a later response for this id is discarded.
    pub fn expire(mut self) -> CommandError {
        self.state = SlotState::TimedOut;
        if self.manager.withdraw(&self.id) {
            self.manager
                .counters
                .timed_out
                .fetch_add(1, Ordering::Relaxed);
        }
        self.timeout_error()
    }

    /// Stop waiting; a later response for this id is discarded
    pub fn cancel(mut self) {
        self.abandon();
    }

    fn abandon(&mut self) {
        if self.state != SlotState::Waiting {
            return;
        }
        self.state = SlotState::Cancelled;
        if self.manager.withdraw(&self.id) {
            self.manager
                .counters
                .cancelled
                .fetch_add(1, Ordering::Relaxed);
            debug!("Command {} ({}) cancelled", self.id, self.command_type);
        }
    }

    fn timeout_error(&self) -> CommandError {
        CommandError::Timeout {
            command_type: self.command_type.clone(),
            timeout: self.timeout,
        }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl fmt::Debug for PendingSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSlot")
            .field("id", &self.id)
            .field("command_type", &self.command_type)
            .field("state", &self.state)
            .finish()
    }
}
