//! Process-wide kill switch.
//!
//! A single atomically-readable flag with a watch channel for tasks that
//! want to be woken instead of polling. Engaging is idempotent and one-way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

#[derive(Clone)]
pub struct KillSwitch {
    engaged: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            engaged: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
        }
    }

    pub fn engage(&self, reason: &str) {
        if !self.engaged.swap(true, Ordering::SeqCst) {
            warn!(reason, "kill switch engaged");
            let _ = self.tx.send(true);
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    /// A receiver that resolves once the switch is engaged.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn engage_is_one_way_and_wakes_subscribers() {
        let kill = KillSwitch::new();
        let mut rx = kill.subscribe();
        assert!(!kill.is_engaged());

        kill.engage("test");
        kill.engage("again");
        assert!(kill.is_engaged());

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
