//! Background expiry of pending slots

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

use super::manager::CorrelationManager;

/// Periodically times out slots nobody is awaiting
///
/// Waiters enforce their own deadline; the sweeper only reclaims slots whose
/// handle is held but never awaited.
pub struct TimeoutSweeper {
    manager: Arc<CorrelationManager>,
    check_interval: Duration,
}

impl TimeoutSweeper {
    /// Create a new timeout sweeper
    pub fn new(manager: Arc<CorrelationManager>, check_interval: Duration) -> Self {
        Self {
            manager,
            check_interval,
        }
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.manager.expire_overdue();
                    if !expired.is_empty() {
                        debug!("Expired {} pending commands", expired.len());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweeper_expires_unawaited_slot() {
        let manager = CorrelationManager::new(100);
        let slot = manager.begin("test-type", Duration::from_millis(10));

        let (stop_tx, stop_rx) = watch::channel(false);
        let sweeper = TimeoutSweeper::new(manager.clone(), Duration::from_millis(5));
        let task = tokio::spawn(async move { sweeper.run(stop_rx).await });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(manager.in_flight(), 0);
        assert_eq!(manager.stats().timed_out, 1);

        let err = slot.wait().await.expect_err("expired");
        assert!(err.is_timeout());

        stop_tx.send(true).expect("stop");
        task.await.expect("sweeper exits");
    }
}
