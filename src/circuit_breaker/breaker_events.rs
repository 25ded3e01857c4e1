//! State-change notifications and cumulative breaker metrics

use super::breaker::BreakerState;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Emitted after every state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChangeEvent {
    pub dependency: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
    /// Value of the breaker's state-change counter after this transition
    pub state_changes: u64,
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&StateChangeEvent) + Send + Sync>;

/// Registered state-change listeners
#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
}

impl ListenerSet {
    pub(crate) fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateChangeEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Invoke every listener; a panicking listener is logged and skipped
    pub(crate) fn emit(&self, event: &StateChangeEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener(event)));
            if let Err(panic) = result {
                let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                warn!(
                    dependency = %event.dependency,
                    panic_msg = %panic_msg,
                    "Circuit breaker listener panicked"
                );
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Point-in-time view of a breaker for diagnostics surfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerMetrics {
    pub dependency: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub half_open_calls: u32,
    pub half_open_successes: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub state_changes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event() -> StateChangeEvent {
        StateChangeEvent {
            dependency: "feed".to_string(),
            from: BreakerState::Closed,
            to: BreakerState::Open,
            at: Utc::now(),
            state_changes: 1,
        }
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let set = ListenerSet::default();
        let calls = Arc::new(AtomicUsize::new(0));
        set.subscribe(|_| panic!("listener bug"));
        let calls_clone = Arc::clone(&calls);
        set.subscribe(move |e| {
            assert_eq!(e.to, BreakerState::Open);
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        set.emit(&event());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let set = ListenerSet::default();
        let id = set.subscribe(|_| {});
        assert_eq!(set.len(), 1);
        assert!(set.unsubscribe(id));
        assert!(!set.unsubscribe(id));
        assert_eq!(set.len(), 0);
    }
}
