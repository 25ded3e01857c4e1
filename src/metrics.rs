//! Metrics collection and export module

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::time::Instant;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Nonce ledger
    pub nonce_reservations: IntCounter,
    pub nonce_conflicts: IntCounter,
    pub nonce_releases: IntCounter,
    pub nonce_releases_explicit: IntCounter,
    pub nonce_releases_on_drop: IntCounter,
    pub nonce_confirmations: IntCounter,
    pub ledger_records: IntGauge,

    // Circuit breakers
    pub breaker_state_changes: IntCounterVec,
    pub breaker_rejections: IntCounterVec,
    pub breaker_fallbacks: IntCounterVec,

    // Signing pipeline
    pub pipeline_requests: IntCounterVec,
    pub pipeline_signed: IntCounterVec,
    pub pipeline_rejections: IntCounterVec,
    pub pipeline_warnings: IntCounterVec,
    pub stale_quotes_served: IntCounter,

    // Histograms
    pub stage_latency: HistogramVec,
    pub simulation_latency: Histogram,
    pub signing_latency: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let nonce_reservations = IntCounter::with_opts(Opts::new(
            "nonce_reservations_total",
            "Number of nonces reserved",
        ))?;

        let nonce_conflicts = IntCounter::with_opts(Opts::new(
            "nonce_conflicts_total",
            "Number of nonce reservations or validations rejected",
        ))?;

        let nonce_releases = IntCounter::with_opts(Opts::new(
            "nonce_releases_total",
            "Number of pending nonces released",
        ))?;

        let nonce_releases_explicit = IntCounter::with_opts(Opts::new(
            "nonce_releases_explicit_total",
            "Number of reservations explicitly released",
        ))?;

        let nonce_releases_on_drop = IntCounter::with_opts(Opts::new(
            "nonce_releases_on_drop_total",
            "Number of reservations auto-released via Drop",
        ))?;

        let nonce_confirmations = IntCounter::with_opts(Opts::new(
            "nonce_confirmations_total",
            "Number of nonces confirmed as used",
        ))?;

        let ledger_records = IntGauge::with_opts(Opts::new(
            "ledger_records",
            "Number of (account, chain) records held by the nonce ledger",
        ))?;

        let breaker_state_changes = IntCounterVec::new(
            Opts::new(
                "breaker_state_changes_total",
                "Circuit breaker transitions by dependency and target state",
            ),
            &["dependency", "to"],
        )?;

        let breaker_rejections = IntCounterVec::new(
            Opts::new(
                "breaker_rejections_total",
                "Calls rejected by an open or saturated circuit breaker",
            ),
            &["dependency"],
        )?;

        let breaker_fallbacks = IntCounterVec::new(
            Opts::new(
                "breaker_fallbacks_total",
                "Rejected calls resolved through a fallback",
            ),
            &["dependency"],
        )?;

        let pipeline_requests = IntCounterVec::new(
            Opts::new("pipeline_requests_total", "Signing requests by kind"),
            &["kind"],
        )?;

        let pipeline_signed = IntCounterVec::new(
            Opts::new("pipeline_signed_total", "Successfully signed requests by kind"),
            &["kind"],
        )?;

        let pipeline_rejections = IntCounterVec::new(
            Opts::new(
                "pipeline_rejections_total",
                "Signing requests rejected by reason code",
            ),
            &["reason"],
        )?;

        let pipeline_warnings = IntCounterVec::new(
            Opts::new("pipeline_warnings_total", "Non-fatal warnings by code"),
            &["code"],
        )?;

        let stale_quotes_served = IntCounter::with_opts(Opts::new(
            "stale_quotes_served_total",
            "Quotes served from cache because the quote provider was unavailable",
        ))?;

        let stage_latency = HistogramVec::new(
            HistogramOpts::new("pipeline_stage_latency_seconds", "Pipeline stage latency")
                .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["stage"],
        )?;

        let simulation_latency = Histogram::with_opts(
            HistogramOpts::new("simulation_latency_seconds", "Simulation call latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
        )?;

        let signing_latency = Histogram::with_opts(
            HistogramOpts::new("signing_latency_seconds", "External signer latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        // Register all metrics
        registry.register(Box::new(nonce_reservations.clone()))?;
        registry.register(Box::new(nonce_conflicts.clone()))?;
        registry.register(Box::new(nonce_releases.clone()))?;
        registry.register(Box::new(nonce_releases_explicit.clone()))?;
        registry.register(Box::new(nonce_releases_on_drop.clone()))?;
        registry.register(Box::new(nonce_confirmations.clone()))?;
        registry.register(Box::new(ledger_records.clone()))?;
        registry.register(Box::new(breaker_state_changes.clone()))?;
        registry.register(Box::new(breaker_rejections.clone()))?;
        registry.register(Box::new(breaker_fallbacks.clone()))?;
        registry.register(Box::new(pipeline_requests.clone()))?;
        registry.register(Box::new(pipeline_signed.clone()))?;
        registry.register(Box::new(pipeline_rejections.clone()))?;
        registry.register(Box::new(pipeline_warnings.clone()))?;
        registry.register(Box::new(stale_quotes_served.clone()))?;
        registry.register(Box::new(stage_latency.clone()))?;
        registry.register(Box::new(simulation_latency.clone()))?;
        registry.register(Box::new(signing_latency.clone()))?;

        Ok(Self {
            registry,
            nonce_reservations,
            nonce_conflicts,
            nonce_releases,
            nonce_releases_explicit,
            nonce_releases_on_drop,
            nonce_confirmations,
            ledger_records,
            breaker_state_changes,
            breaker_rejections,
            breaker_fallbacks,
            pipeline_requests,
            pipeline_signed,
            pipeline_rejections,
            pipeline_warnings,
            stale_quotes_served,
            stage_latency,
            simulation_latency,
            signing_latency,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the Prometheus text format
    pub fn export_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.elapsed_secs());
    }

    /// Record into the per-stage latency histogram
    pub fn observe_stage(&self, stage: &str) {
        metrics()
            .stage_latency
            .with_label_values(&[stage])
            .observe(self.elapsed_secs());
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
