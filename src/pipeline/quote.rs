//! Quote boundary
//!
//! Prices are informational: a failed fetch degrades to the last good quote
//! for the pair, flagged stale, and never blocks a signature on its own.

use crate::circuit_breaker::{BreakerError, CircuitBreaker, ClassifyFailure, FailureKind};
use crate::errors::PipelineError;
use crate::metrics::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Asset pair written `BASE/QUOTE`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QuotePair {
    pub base: String,
    pub quote: String,
}

impl FromStr for QuotePair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| format!("expected BASE/QUOTE, got '{}'", s))?;
        let (base, quote) = (base.trim(), quote.trim());
        if base.is_empty() || quote.is_empty() {
            return Err(format!("expected BASE/QUOTE, got '{}'", s));
        }
        Ok(Self {
            base: base.to_ascii_uppercase(),
            quote: quote.to_ascii_uppercase(),
        })
    }
}

impl fmt::Display for QuotePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub pair: QuotePair,
    pub price: f64,
    pub fetched_at: DateTime<Utc>,
    /// Served from cache because the provider was unavailable
    pub stale: bool,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QuoteError {
    #[error("quote provider returned HTTP {status}")]
    Http { status: u16 },

    #[error("quote provider network error: {0}")]
    Network(String),

    #[error("quote provider timed out after {0}ms")]
    Timeout(u64),

    #[error("no price for {0}")]
    UnknownPair(String),

    /// Fallback found nothing cached for the pair
    #[error("no cached quote for {0}")]
    NoCachedQuote(String),
}

impl ClassifyFailure for QuoteError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            QuoteError::Http { status } => FailureKind::from_status(*status),
            QuoteError::Network(_) => FailureKind::Network,
            QuoteError::Timeout(_) => FailureKind::Timeout,
            QuoteError::UnknownPair(_) | QuoteError::NoCachedQuote(_) => FailureKind::Application,
        }
    }
}

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn fetch_price(&self, pair: &QuotePair) -> Result<f64, QuoteError>;
}

/// Breaker-protected quote lookups with a last-good cache
pub struct QuoteService {
    provider: Arc<dyn QuoteProvider>,
    breaker: Arc<CircuitBreaker>,
    last_good: DashMap<QuotePair, Quote>,
}

impl QuoteService {
    pub fn new(provider: Arc<dyn QuoteProvider>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            provider,
            breaker,
            last_good: DashMap::new(),
        }
    }

    fn cached(&self, pair: &QuotePair) -> Result<Quote, QuoteError> {
        let mut quote = self
            .last_good
            .get(pair)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| QuoteError::NoCachedQuote(pair.to_string()))?;
        quote.stale = true;
        metrics().stale_quotes_served.inc();
        debug!(%pair, fetched_at = %quote.fetched_at, "Serving stale quote");
        Ok(quote)
    }

    /// Fresh quote, or the last good one marked stale
    pub async fn get_quote(&self, pair: &QuotePair) -> Result<Quote, PipelineError> {
        let result = self
            .breaker
            .execute_with_fallback(
                || async {
                    let price = self.provider.fetch_price(pair).await?;
                    Ok::<_, QuoteError>(Quote {
                        pair: pair.clone(),
                        price,
                        fetched_at: Utc::now(),
                        stale: false,
                    })
                },
                || async { self.cached(pair) },
            )
            .await;

        match result {
            Ok(quote) => {
                if !quote.stale {
                    self.last_good.insert(pair.clone(), quote.clone());
                }
                Ok(quote)
            }
            Err(BreakerError::Operation(err)) => {
                warn!(%pair, error = %err, "Quote fetch failed");
                self.cached(pair)
                    .map_err(|_| PipelineError::unavailable(self.breaker.name(), Some(err.to_string())))
            }
            Err(err) => Err(PipelineError::unavailable(
                self.breaker.name(),
                Some(err.to_string()),
            )),
        }
    }

    /// Fetch several pairs concurrently
    pub async fn get_quotes(&self, pairs: &[QuotePair]) -> Vec<Result<Quote, PipelineError>> {
        futures::future::join_all(pairs.iter().map(|pair| self.get_quote(pair))).await
    }
}

impl fmt::Debug for QuoteService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuoteService")
            .field("breaker", &self.breaker.name())
            .field("cached_pairs", &self.last_good.len())
            .finish()
    }
}
