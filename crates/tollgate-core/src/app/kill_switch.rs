//! KillSwitch - 外部からの停止シグナル
//!
//! A one-way trigger: once set it stays set. Clones share the same switch.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct KillSwitch {
    tx: Arc<watch::Sender<bool>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        // send_replace never fails, even with no receivers
        let was = self.tx.send_replace(true);
        if !was {
            tracing::warn!("kill switch triggered");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once the switch is set.
    pub async fn triggered(&self) {
        let mut rx = self.subscribe();
        // only fails when the sender is gone, and we hold it
        let _ = rx.wait_for(|set| *set).await;
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
    use std::time::Duration;

    #[tokio::test]
    async fn clones_share_state() {
        let ks = KillSwitch::new();
        let other = ks.clone();
        assert!(!other.is_triggered());
        ks.trigger();
        assert!(other.is_triggered());
        ks.trigger();
        assert!(other.is_triggered());
    }

    #[tokio::test]
    async fn waiters_wake_on_trigger() {
        let ks = KillSwitch::new();
        let waiter = {
            let ks = ks.clone();
            tokio::spawn(async move { ks.triggered().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ks.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
