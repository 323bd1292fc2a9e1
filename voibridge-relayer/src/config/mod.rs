//! Configuration module for voibridge-relayer.
//!
//! Loads the TOML file, applies CLI overrides, validates it and converts it
//! into the runtime types the pipeline components take.

pub mod file;

use crate::config::file::FileConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use voibridge_core::config::{
    BridgeRules, DestinationConfig, PipelineConfig, ReconcilerConfig, SignerConfig, SourceConfig,
};
use voibridge_core::utils::backoff::RetryPolicy;
use voibridge_sdk::Address;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Loaded configuration, ready to hand to the pipeline.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub listen: SocketAddr,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub signer: SignerConfig,
    pub rules: BridgeRules,
    pub pipeline: PipelineConfig,
    pub reconciler: ReconcilerConfig,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: std::path::PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    /// Read, validate and convert the configuration file.
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        self.load_str(&config_content)
    }

    pub fn load_str(&self, content: &str) -> Result<LoadedConfig, ConfigError> {
        let mut file_config: FileConfig = toml::from_str(content)?;

        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }

        let treasury = self.validate(&file_config)?;
        Ok(build_loaded_config(file_config, treasury))
    }

    fn validate(&self, config: &FileConfig) -> Result<Address, ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if config.source.indexer_urls.is_empty() {
            return invalid("source.indexer_urls must not be empty".to_string());
        }
        if config.source.log_prefix.is_empty() {
            return invalid("source.log_prefix must not be empty".to_string());
        }
        if config.source.page_limit == 0 || config.source.max_pages_per_cycle == 0 {
            return invalid("source paging limits must be positive".to_string());
        }
        if config.source.missing_transfer_attempts == 0 {
            return invalid("source.missing_transfer_attempts must be positive".to_string());
        }
        if config.destination.validity_rounds == 0 {
            return invalid("destination.validity_rounds must be positive".to_string());
        }
        if config.signer.key_handle.trim().is_empty() {
            return invalid("signer.key_handle must not be empty".to_string());
        }
        if config.bridge.min_amount == 0 || config.bridge.min_amount > config.bridge.max_amount {
            return invalid(format!(
                "bridge limits must satisfy 0 < min_amount <= max_amount, got {}..={}",
                config.bridge.min_amount, config.bridge.max_amount
            ));
        }
        if config.pipeline.backoff_initial_ms > config.pipeline.backoff_max_ms {
            return invalid("pipeline.backoff_initial_ms exceeds backoff_max_ms".to_string());
        }

        let treasury: Address = match config.source.treasury_address.parse() {
            Ok(address) => address,
            Err(e) => return invalid(format!("source.treasury_address: {e}")),
        };
        if treasury.is_zero() {
            return invalid("source.treasury_address must not be the zero address".to_string());
        }
        Ok(treasury)
    }
}

fn build_loaded_config(file_config: FileConfig, treasury: Address) -> LoadedConfig {
    let FileConfig {
        server,
        source,
        destination,
        signer,
        bridge,
        pipeline,
        reconciler,
    } = file_config;

    LoadedConfig {
        listen: server.listen,
        source: SourceConfig {
            indexer_urls: source.indexer_urls,
            indexer_token: source.indexer_token,
            validator_app_id: source.validator_app_id,
            log_prefix: source.log_prefix.into_bytes(),
            asset_id: source.asset_id,
            treasury,
            page_limit: source.page_limit,
            max_pages_per_cycle: source.max_pages_per_cycle,
            lookback_rounds: source.lookback_rounds,
            start_round: source.start_round,
            auto_start_lookback: source.auto_start_lookback,
            missing_transfer_attempts: source.missing_transfer_attempts,
            request_timeout: Duration::from_secs(source.request_timeout_secs),
        },
        destination: DestinationConfig {
            algod_url: destination.algod_url,
            algod_token: destination.algod_token,
            indexer_url: destination.indexer_url,
            indexer_token: destination.indexer_token,
            escrow_app_id: destination.escrow_app_id,
            asset_id: destination.asset_id,
            fee_microalgos: destination.fee_microalgos,
            validity_rounds: destination.validity_rounds,
            note_prefix: destination.note_prefix.into_bytes(),
            request_timeout: Duration::from_secs(destination.request_timeout_secs),
        },
        signer: SignerConfig {
            url: signer.url,
            key_handle: signer.key_handle,
            auth_token: signer.auth_token,
        },
        rules: BridgeRules {
            min_amount: bridge.min_amount,
            max_amount: bridge.max_amount,
        },
        pipeline: PipelineConfig {
            poll_interval: Duration::from_secs(pipeline.poll_interval_secs),
            confirmation_timeout: Duration::from_secs(pipeline.confirmation_timeout_secs),
            retry: RetryPolicy {
                max_retries: pipeline.max_retries,
                initial: Duration::from_millis(pipeline.backoff_initial_ms),
                max: Duration::from_millis(pipeline.backoff_max_ms),
            },
        },
        reconciler: ReconcilerConfig {
            interval: Duration::from_secs(reconciler.interval_secs),
            grace_period: Duration::from_secs(reconciler.grace_period_secs),
            stale_claim_after: Duration::from_secs(reconciler.stale_claim_secs),
            resubmit_after: Duration::from_secs(reconciler.resubmit_after_secs),
            batch_limit: reconciler.batch_limit,
        },
    }
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}
