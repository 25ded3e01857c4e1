//! Process-wide owner of breakers, the nonce ledger and its sweeper
//!
//! Built once from [`Config`] and shared by `Arc`; callers receive handles
//! and never construct global state themselves.

use super::breaker::CircuitBreaker;
use super::breaker_events::BreakerMetrics;
use crate::config::Config;
use crate::nonce_ledger::{LedgerSweeper, NonceLedger};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Backend dependencies guarded by their own breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    GeneralApi,
    Community,
    Feed,
    Marketplace,
    Simulation,
    Quote,
}

impl Dependency {
    pub const ALL: [Dependency; 6] = [
        Dependency::GeneralApi,
        Dependency::Community,
        Dependency::Feed,
        Dependency::Marketplace,
        Dependency::Simulation,
        Dependency::Quote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::GeneralApi => "general_api",
            Dependency::Community => "community",
            Dependency::Feed => "feed",
            Dependency::Marketplace => "marketplace",
            Dependency::Simulation => "simulation",
            Dependency::Quote => "quote",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == name)
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct DependencyRegistry {
    breakers: [Arc<CircuitBreaker>; 6],
    ledger: Arc<NonceLedger>,
    sweeper: LedgerSweeper,
}

impl DependencyRegistry {
    pub fn new(config: &Config) -> Self {
        let breakers = Dependency::ALL.map(|dependency| {
            Arc::new(CircuitBreaker::new(
                dependency.as_str(),
                config.breakers.for_dependency(dependency),
            ))
        });
        Self {
            breakers,
            ledger: Arc::new(NonceLedger::with_max_gap(config.ledger.max_nonce_gap)),
            sweeper: LedgerSweeper::new(
                config.ledger.sweep_interval(),
                config.ledger.max_idle(),
            ),
        }
    }

    /// Start background tasks. Must be called inside a tokio runtime.
    pub fn start(&self) {
        self.sweeper.start(Arc::clone(&self.ledger));
        info!("Dependency registry started");
    }

    pub fn breaker(&self, dependency: Dependency) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breakers[dependency.index()])
    }

    pub fn ledger(&self) -> Arc<NonceLedger> {
        Arc::clone(&self.ledger)
    }

    /// Snapshot of every breaker, in [`Dependency::ALL`] order
    pub fn health(&self) -> Vec<BreakerMetrics> {
        self.breakers.iter().map(|b| b.metrics()).collect()
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.is_running()
    }

    /// Stop background tasks
    pub async fn shutdown(&self) {
        self.sweeper.stop().await;
        info!("Dependency registry shut down");
    }
}
