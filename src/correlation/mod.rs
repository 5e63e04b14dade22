//! Request/response correlation for remote calls

mod manager;
mod timeout;

pub use manager::{CorrelationId, CorrelationManager, CorrelationStats, PendingSlot, SlotState};
pub use timeout::TimeoutSweeper;
