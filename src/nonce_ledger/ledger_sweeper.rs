//! Background eviction of idle nonce records

use super::ledger::NonceLedger;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};

/// Periodically evicts ledger records idle for longer than `max_idle`
#[derive(Debug)]
pub struct LedgerSweeper {
    sweep_interval: Duration,
    max_idle: Duration,
    shutdown: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LedgerSweeper {
    pub fn new(sweep_interval: Duration, max_idle: Duration) -> Self {
        Self {
            sweep_interval,
            max_idle,
            shutdown: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the sweep task. Calling `start` on a running sweeper is a no-op.
    pub fn start(&self, ledger: Arc<NonceLedger>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            warn!("Ledger sweeper already running");
            return;
        }

        let shutdown = Arc::clone(&self.shutdown);
        let max_idle = self.max_idle;
        let sweep_interval = self.sweep_interval;

        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(max_idle_secs = max_idle.as_secs(), "Ledger sweeper started");
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {
                        ledger.evict_idle(max_idle);
                    }
                }
            }
            debug!("Ledger sweeper stopped");
        }));
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the sweep task and wait for it to exit
    pub async fn stop(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            self.shutdown.notify_one();
            if let Err(err) = handle.await {
                warn!(error = %err, "Ledger sweeper task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, ChainId};

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_idle_records() {
        let ledger = Arc::new(NonceLedger::new());
        ledger.confirm(Address::from_bytes([1; 20]), ChainId(1), 0);

        let sweeper = LedgerSweeper::new(Duration::from_secs(10), Duration::from_secs(30));
        sweeper.start(Arc::clone(&ledger));
        assert!(sweeper.is_running());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(ledger.len(), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(ledger.is_empty());

        sweeper.stop().await;
        assert!(!sweeper.is_running());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let sweeper = LedgerSweeper::new(Duration::from_secs(1), Duration::from_secs(1));
        sweeper.stop().await;
        assert!(!sweeper.is_running());
    }
}
