//! Configuration module for signguard
//!
//! Loads the TOML configuration file, applies `SIGNGUARD_*` environment
//! overrides (after reading `.env` when present) and validates the result.
//! Every field has a serde default so a partial file is valid.

use crate::circuit_breaker::breaker_registry::Dependency;
use crate::circuit_breaker::BreakerConfig;
use crate::pipeline::risk::MediumRiskPolicy;
use crate::pipeline::simulate::SimulationFallbackPolicy;
use crate::structured_logging::LogFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "SIGNGUARD_";

const WEI_PER_GWEI: u128 = 1_000_000_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid environment override {key}={value}: {reason}")]
    Override {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub gas: GasConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub breakers: BreakersConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Chain the local signer is connected to, used by the CLI when
    /// `--chain-id` is not given
    #[serde(default)]
    pub chain_id: Option<u64>,

    #[serde(default)]
    pub medium_risk_policy: MediumRiskPolicy,

    #[serde(default)]
    pub simulation_fallback: SimulationFallbackPolicy,

    /// Simulated cost above which a warning is attached
    #[serde(default = "default_high_cost_warning_gwei")]
    pub high_cost_warning_gwei: u64,

    /// Headroom added to the simulated gas estimate when the request has no limit
    #[serde(default = "default_gas_headroom_percent")]
    pub gas_headroom_percent: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Destinations that are always high risk
    #[serde(default)]
    pub blocked_destinations: Vec<String>,

    /// Value above which a transfer is flagged as low risk
    #[serde(default = "default_large_value_gwei")]
    pub large_value_gwei: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasConfig {
    #[serde(default = "default_min_gas_limit")]
    pub min_gas_limit: u64,

    #[serde(default = "default_max_gas_limit")]
    pub max_gas_limit: u64,

    /// Gas limits above this produce a warning
    #[serde(default = "default_warn_gas_limit")]
    pub warn_gas_limit: u64,

    /// Hard cap for `gas_price` / `max_fee_per_gas`
    #[serde(default = "default_max_fee_gwei")]
    pub max_fee_gwei: u64,

    /// Fees above this produce a warning
    #[serde(default = "default_warn_fee_gwei")]
    pub warn_fee_gwei: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Records idle for longer than this are evicted
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Largest forward jump accepted by `validate_and_consume`
    #[serde(default = "default_max_nonce_gap")]
    pub max_nonce_gap: u64,
}

/// Breaker settings: `[breakers.default]` plus full per-dependency
/// replacements under `[breakers.overrides.<dependency>]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakersConfig {
    #[serde(default)]
    pub default: BreakerConfig,

    #[serde(default)]
    pub overrides: HashMap<String, BreakerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

// Default value functions
fn default_high_cost_warning_gwei() -> u64 { 50_000_000 }
fn default_gas_headroom_percent() -> u64 { 20 }
fn default_large_value_gwei() -> u64 { 10_000_000_000 }
fn default_min_gas_limit() -> u64 { 21_000 }
fn default_max_gas_limit() -> u64 { 30_000_000 }
fn default_warn_gas_limit() -> u64 { 10_000_000 }
fn default_max_fee_gwei() -> u64 { 10_000 }
fn default_warn_fee_gwei() -> u64 { 500 }
fn default_max_idle_secs() -> u64 { 3_600 }
fn default_sweep_interval_secs() -> u64 { 60 }
fn default_max_nonce_gap() -> u64 { crate::nonce_ledger::DEFAULT_MAX_NONCE_GAP }
fn default_log_level() -> String { "info".to_string() }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chain_id: None,
            medium_risk_policy: MediumRiskPolicy::default(),
            simulation_fallback: SimulationFallbackPolicy::default(),
            high_cost_warning_gwei: default_high_cost_warning_gwei(),
            gas_headroom_percent: default_gas_headroom_percent(),
        }
    }
}

impl PipelineConfig {
    pub fn high_cost_warning_wei(&self) -> u128 {
        self.high_cost_warning_gwei as u128 * WEI_PER_GWEI
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            blocked_destinations: Vec::new(),
            large_value_gwei: default_large_value_gwei(),
        }
    }
}

impl RiskConfig {
    pub fn large_value_wei(&self) -> u128 {
        self.large_value_gwei as u128 * WEI_PER_GWEI
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            min_gas_limit: default_min_gas_limit(),
            max_gas_limit: default_max_gas_limit(),
            warn_gas_limit: default_warn_gas_limit(),
            max_fee_gwei: default_max_fee_gwei(),
            warn_fee_gwei: default_warn_fee_gwei(),
        }
    }
}

impl GasConfig {
    pub fn max_fee_wei(&self) -> u128 {
        self.max_fee_gwei as u128 * WEI_PER_GWEI
    }

    pub fn warn_fee_wei(&self) -> u128 {
        self.warn_fee_gwei as u128 * WEI_PER_GWEI
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: default_max_idle_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_nonce_gap: default_max_nonce_gap(),
        }
    }
}

impl LedgerConfig {
    pub fn max_idle(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_idle_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

impl BreakersConfig {
    /// Effective settings for one dependency
    pub fn for_dependency(&self, dependency: Dependency) -> BreakerConfig {
        self.overrides
            .get(dependency.as_str())
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load `.env`, the TOML file, then environment overrides, and validate
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SIGNGUARD_*` overrides from an iterator of environment pairs
    ///
    /// Recognised keys: `LOG_LEVEL`, `LOG_FORMAT`, `MEDIUM_RISK_POLICY`,
    /// `SIMULATION_FALLBACK`, `CHAIN_ID`. Unknown keys are ignored.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let invalid = |reason: String| ConfigError::Override {
                key: key.clone(),
                value: value.clone(),
                reason,
            };
            match name {
                "LOG_LEVEL" => self.logging.level = value.clone(),
                "LOG_FORMAT" => self.logging.format = value.parse().map_err(invalid)?,
                "MEDIUM_RISK_POLICY" => {
                    self.pipeline.medium_risk_policy = value.parse().map_err(invalid)?
                }
                "SIMULATION_FALLBACK" => {
                    self.pipeline.simulation_fallback = value.parse().map_err(invalid)?
                }
                "CHAIN_ID" => {
                    let chain_id = value
                        .parse::<u64>()
                        .map_err(|e| invalid(e.to_string()))?;
                    self.pipeline.chain_id = Some(chain_id);
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let gas = &self.gas;
        if gas.min_gas_limit == 0 || gas.min_gas_limit > gas.max_gas_limit {
            return Err(ConfigError::Invalid(format!(
                "gas limit bounds are inverted or zero ({}..{})",
                gas.min_gas_limit, gas.max_gas_limit
            )));
        }
        if gas.warn_gas_limit > gas.max_gas_limit {
            return Err(ConfigError::Invalid(
                "gas.warn_gas_limit exceeds gas.max_gas_limit".to_string(),
            ));
        }
        if gas.max_fee_gwei == 0 || gas.warn_fee_gwei > gas.max_fee_gwei {
            return Err(ConfigError::Invalid(
                "gas.warn_fee_gwei must not exceed a non-zero gas.max_fee_gwei".to_string(),
            ));
        }
        if self.ledger.max_idle_secs == 0 || self.ledger.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "ledger durations must be greater than 0".to_string(),
            ));
        }
        if self.pipeline.chain_id == Some(0) {
            return Err(ConfigError::Invalid("pipeline.chain_id must not be 0".to_string()));
        }

        self.breakers
            .default
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("breakers.default: {}", e)))?;
        for (name, breaker) in &self.breakers.overrides {
            if Dependency::from_name(name).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "breakers.overrides: unknown dependency '{}'",
                    name
                )));
            }
            breaker
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("breakers.overrides.{}: {}", name, e)))?;
        }

        for destination in &self.risk.blocked_destinations {
            destination.parse::<crate::types::Address>().map_err(|e| {
                ConfigError::Invalid(format!("risk.blocked_destinations: {}: {}", destination, e))
            })?;
        }
        Ok(())
    }
}
