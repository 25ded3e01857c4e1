//! signguard command line
//!
//! Offline tooling around the signing pipeline: configuration checks,
//! local validation of a request file and key generation.

// Compiler warning configuration
#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use signguard::config::Config;
use signguard::pipeline::{
    ExternalSigner, LocalKeySigner, SignerError, SimulationError, SimulationOutcome, Simulator,
    SigningPipeline, SigningRequest, TransactionFields, TypedData,
};
use signguard::structured_logging::{init_logging, LogFormat};
use signguard::types::{Address, ChainId, SignatureBytes};
use signguard::DependencyRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "signguard.toml", env = "SIGNGUARD_CONFIG")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Log format override (pretty or json)
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a configuration file
    CheckConfig {
        /// File to check; defaults to --config
        file: Option<PathBuf>,
    },
    /// Run the local validation stages against a JSON request
    Validate {
        /// Request file (`SigningRequest` as JSON)
        request: PathBuf,
        /// Chain the signer is connected to; defaults to pipeline.chain_id
        #[arg(long)]
        chain_id: Option<u64>,
        /// Account the signer controls
        #[arg(long)]
        account: Address,
    },
    /// Print breaker state for every dependency as JSON
    Health,
    /// Generate a fresh local key
    Keygen {
        #[arg(long, default_value_t = 1)]
        chain_id: u64,
        /// Also print the secret key
        #[arg(long)]
        show_secret: bool,
    },
}

/// Signer identity for offline validation; refuses to sign
struct WatchOnlySigner {
    account: Address,
    chain_id: ChainId,
}

#[async_trait]
impl ExternalSigner for WatchOnlySigner {
    fn account(&self) -> Address {
        self.account
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn sign_transaction(
        &self,
        _fields: &TransactionFields,
        _chain_id: ChainId,
    ) -> Result<SignatureBytes, SignerError> {
        Err(SignerError::Unavailable("watch-only signer".to_string()))
    }

    async fn sign_message(&self, _message: &[u8]) -> Result<SignatureBytes, SignerError> {
        Err(SignerError::Unavailable("watch-only signer".to_string()))
    }

    async fn sign_typed_data(&self, _typed_data: &TypedData) -> Result<SignatureBytes, SignerError> {
        Err(SignerError::Unavailable("watch-only signer".to_string()))
    }
}

/// Simulator for offline use; every call fails as a network error
struct OfflineSimulator;

#[async_trait]
impl Simulator for OfflineSimulator {
    async fn simulate(&self, _fields: &TransactionFields) -> Result<SimulationOutcome, SimulationError> {
        Err(SimulationError::Network("offline".to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, from_file) = load_config(&args.config)?;
    let level = if args.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    init_logging(level, args.log_format.unwrap_or(config.logging.format))?;
    if !from_file {
        warn!("Config file '{}' not found, using defaults", args.config.display());
    }

    match args.command {
        Command::CheckConfig { file } => {
            let path = file.unwrap_or(args.config);
            let config = Config::from_file_with_env(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            info!(path = %path.display(), "Configuration is valid");
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Command::Validate {
            request,
            chain_id,
            account,
        } => {
            let chain_id = chain_id
                .or(config.pipeline.chain_id)
                .context("--chain-id is required when pipeline.chain_id is not configured")?;
            let content = std::fs::read_to_string(&request)
                .with_context(|| format!("Failed to read {}", request.display()))?;
            let request: SigningRequest =
                serde_json::from_str(&content).context("Request is not a valid signing request")?;

            let registry = Arc::new(DependencyRegistry::new(&config));
            let signer = Arc::new(WatchOnlySigner {
                account,
                chain_id: ChainId(chain_id),
            });
            let pipeline = SigningPipeline::builder(registry, signer, Arc::new(OfflineSimulator))
                .config(&config)
                .build()?;

            let report = pipeline.validate(&request);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                std::process::exit(2);
            }
        }
        Command::Health => {
            let registry = DependencyRegistry::new(&config);
            println!("{}", serde_json::to_string_pretty(&registry.health())?);
        }
        Command::Keygen {
            chain_id,
            show_secret,
        } => {
            let signer = LocalKeySigner::generate(ChainId(chain_id));
            println!("account:    {}", signer.account());
            println!("public key: {}", signer.public_key_hex());
            if show_secret {
                let secret = signer.secret_hex();
                println!("secret:     {}", secret.as_str());
            }
        }
    }

    Ok(())
}

/// Load configuration from file with fallback to defaults
///
/// The flag is false when the file was missing and defaults were used.
fn load_config(path: &Path) -> Result<(Config, bool)> {
    if path.exists() {
        let config = Config::from_file_with_env(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        Ok((config, true))
    } else {
        let mut config = Config::default();
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok((config, false))
    }
}
