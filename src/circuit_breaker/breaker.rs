//! Per-dependency circuit breaker
//!
//! Closed -> Open after `failure_threshold` consecutive qualifying failures
//! (each success in Closed forgives one failure). Open -> Half-Open on the
//! first call after `recovery_timeout`. Half-Open admits at most
//! `half_open_max_calls` trial calls; `half_open_success_threshold` successes
//! close the circuit, any qualifying failure reopens it.
//!
//! The state machine lives behind one short-lived lock. The protected
//! operation always runs outside it, and listeners are invoked after it is
//! released.

use super::breaker_errors::{BreakerError, ClassifyFailure, FailureKind};
use super::breaker_events::{BreakerMetrics, ListenerSet, StateChangeEvent, SubscriptionId};
use crate::metrics::metrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ============================================================================
// STATE AND CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    #[serde(default = "default_half_open_success_threshold")]
    pub half_open_success_threshold: u32,
    /// 4xx statuses that count as breaker failures
    #[serde(default = "default_counted_client_statuses")]
    pub counted_client_statuses: Vec<u16>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_max_calls() -> u32 {
    3
}

fn default_half_open_success_threshold() -> u32 {
    2
}

fn default_counted_client_statuses() -> Vec<u16> {
    vec![401, 408, 429]
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
            half_open_success_threshold: default_half_open_success_threshold(),
            counted_client_statuses: default_counted_client_statuses(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if self.half_open_max_calls == 0 {
            return Err("half_open_max_calls must be at least 1".to_string());
        }
        if self.half_open_success_threshold == 0
            || self.half_open_success_threshold > self.half_open_max_calls
        {
            return Err(format!(
                "half_open_success_threshold must be between 1 and half_open_max_calls ({})",
                self.half_open_max_calls
            ));
        }
        if self.recovery_timeout_ms == 0 {
            return Err("recovery_timeout_ms must be greater than 0".to_string());
        }
        if let Some(bad) = self
            .counted_client_statuses
            .iter()
            .find(|s| !(400..500).contains(*s))
        {
            return Err(format!("counted client status {} is not a 4xx code", bad));
        }
        Ok(())
    }
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_calls: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    state_changes: u64,
    /// Bumped on every transition and reset; outcomes of calls admitted
    /// under an older epoch only touch the cumulative counters.
    epoch: u64,
}

enum Admission {
    Allowed { epoch: u64, trial: bool },
    Rejected(BreakerState),
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    listeners: ListenerSet,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_calls: 0,
                half_open_successes: 0,
                opened_at: None,
                last_success_at: None,
                last_failure_at: None,
                state_changes: 0,
                epoch: 0,
            }),
            listeners: ListenerSet::default(),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state without triggering the Open -> Half-Open check
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == BreakerState::Closed
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateChangeEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock();
        BreakerMetrics {
            dependency: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_calls: inner.half_open_calls,
            half_open_successes: inner.half_open_successes,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            last_success_at: inner.last_success_at,
            last_failure_at: inner.last_failure_at,
            state_changes: inner.state_changes,
        }
    }

    /// Force the breaker back to Closed and clear its counters
    pub fn reset(&self) {
        let event = {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            let event = self.transition(&mut inner, BreakerState::Closed);
            inner.consecutive_failures = 0;
            inner.half_open_calls = 0;
            inner.half_open_successes = 0;
            inner.opened_at = None;
            event
        };
        info!(dependency = %self.name, "Circuit breaker reset");
        self.emit(event);
    }

    /// Run `operation` through the breaker
    ///
    /// Returns [`BreakerError::Unavailable`] without invoking `operation`
    /// when the breaker rejects the call.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyFailure,
    {
        self.run(operation, None::<fn() -> std::future::Ready<Result<T, E>>>)
            .await
    }

    /// Like [`CircuitBreaker::execute`], but a rejected call resolves through
    /// `fallback` instead of failing
    pub async fn execute_with_fallback<T, E, F, Fut, FB, FbFut>(
        &self,
        operation: F,
        fallback: FB,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
        E: ClassifyFailure,
    {
        self.run(operation, Some(fallback)).await
    }

    async fn run<T, E, F, Fut, FB, FbFut>(
        &self,
        operation: F,
        fallback: Option<FB>,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
        E: ClassifyFailure,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let (epoch, trial) = match self.admit() {
            Admission::Allowed { epoch, trial } => (epoch, trial),
            Admission::Rejected(state) => {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                metrics()
                    .breaker_rejections
                    .with_label_values(&[&self.name])
                    .inc();
                return match fallback {
                    Some(fallback) => {
                        metrics()
                            .breaker_fallbacks
                            .with_label_values(&[&self.name])
                            .inc();
                        debug!(dependency = %self.name, %state, "Call rejected, using fallback");
                        fallback().await.map_err(BreakerError::Fallback)
                    }
                    None => {
                        debug!(dependency = %self.name, %state, "Call rejected");
                        Err(BreakerError::Unavailable {
                            dependency: self.name.clone(),
                            state,
                        })
                    }
                };
            }
        };

        // A trial call whose future is dropped before completing gives its slot back
        let guard = scopeguard::guard((), |_| self.return_trial_slot(epoch, trial, "abandoned"));
        let result = operation().await;
        scopeguard::ScopeGuard::into_inner(guard);

        match result {
            Ok(value) => {
                self.on_success(epoch);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(epoch, trial, err.failure_kind());
                Err(BreakerError::Operation(err))
            }
        }
    }

    fn admit(&self) -> Admission {
        let (admission, event) = {
            let mut inner = self.inner.lock();
            let mut event = None;

            if inner.state == BreakerState::Open {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout() {
                    event = self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_calls = 0;
                    inner.half_open_successes = 0;
                }
            }

            let state = inner.state;
            let admission = match state {
                BreakerState::Closed => Admission::Allowed {
                    epoch: inner.epoch,
                    trial: false,
                },
                BreakerState::HalfOpen if inner.half_open_calls < self.config.half_open_max_calls => {
                    inner.half_open_calls += 1;
                    Admission::Allowed {
                        epoch: inner.epoch,
                        trial: true,
                    }
                }
                state => Admission::Rejected(state),
            };
            (admission, event)
        };
        self.emit(event);
        admission
    }

    fn on_success(&self, epoch: u64) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        let event = {
            let mut inner = self.inner.lock();
            inner.last_success_at = Some(Utc::now());
            if inner.epoch != epoch {
                return;
            }
            let state = inner.state;
            match state {
                BreakerState::Closed => {
                    inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);
                    None
                }
                BreakerState::HalfOpen => {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_success_threshold {
                        let event = self.transition(&mut inner, BreakerState::Closed);
                        inner.consecutive_failures = 0;
                        inner.half_open_calls = 0;
                        inner.half_open_successes = 0;
                        inner.opened_at = None;
                        event
                    } else {
                        None
                    }
                }
                BreakerState::Open => None,
            }
        };
        self.emit(event);
    }

    fn on_failure(&self, epoch: u64, trial: bool, kind: FailureKind) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        if !kind.is_counted(&self.config.counted_client_statuses) {
            debug!(dependency = %self.name, ?kind, "Failure not counted by breaker");
            // Uncounted errors free their half-open slot
            self.return_trial_slot(epoch, trial, "inconclusive");
            return;
        }

        let event = {
            let mut inner = self.inner.lock();
            inner.last_failure_at = Some(Utc::now());
            if inner.epoch != epoch {
                return;
            }
            let state = inner.state;
            match state {
                BreakerState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        self.open(&mut inner)
                    } else {
                        None
                    }
                }
                BreakerState::HalfOpen => self.open(&mut inner),
                BreakerState::Open => None,
            }
        };
        self.emit(event);
    }

    /// Give a half-open call slot back without counting the outcome
    fn return_trial_slot(&self, epoch: u64, trial: bool, reason: &'static str) {
        if !trial {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.epoch == epoch && inner.state == BreakerState::HalfOpen {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
            debug!(dependency = %self.name, reason, "Half-open trial slot returned");
        }
    }

    fn open(&self, inner: &mut BreakerInner) -> Option<StateChangeEvent> {
        let event = self.transition(inner, BreakerState::Open);
        inner.opened_at = Some(Instant::now());
        inner.half_open_calls = 0;
        inner.half_open_successes = 0;
        warn!(
            dependency = %self.name,
            consecutive_failures = inner.consecutive_failures,
            recovery_timeout_ms = self.config.recovery_timeout_ms,
            "Circuit breaker opened"
        );
        event
    }

    /// Must be called with the lock held; returns the event to emit once released
    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) -> Option<StateChangeEvent> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        inner.state_changes += 1;
        inner.epoch += 1;
        metrics()
            .breaker_state_changes
            .with_label_values(&[&self.name, &to.to_string()])
            .inc();
        Some(StateChangeEvent {
            dependency: self.name.clone(),
            from,
            to,
            at: Utc::now(),
            state_changes: inner.state_changes,
        })
    }

    fn emit(&self, event: Option<StateChangeEvent>) {
        if let Some(event) = event {
            info!(
                dependency = %event.dependency,
                from = %event.from,
                to = %event.to,
                "Circuit breaker state changed"
            );
            self.listeners.emit(&event);
        }
    }
}
