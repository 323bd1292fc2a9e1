//! TOML file configuration structures.
//!
//! These structs directly map to the `voibridge.toml` file format.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub signer: SignerConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

/// Operator API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address and port to listen on (e.g., "127.0.0.1:8080").
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Source chain (VOI) section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Indexer endpoints, tried in order.
    pub indexer_urls: Vec<Url>,
    #[serde(default)]
    pub indexer_token: Option<String>,
    pub validator_app_id: u64,
    /// UTF-8 prefix that marks a deposit log line.
    pub log_prefix: String,
    pub asset_id: u64,
    pub treasury_address: String,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    #[serde(default = "default_max_pages_per_cycle")]
    pub max_pages_per_cycle: u32,
    #[serde(default = "default_lookback_rounds")]
    pub lookback_rounds: u64,
    #[serde(default)]
    pub start_round: Option<u64>,
    #[serde(default = "default_auto_start_lookback")]
    pub auto_start_lookback: u64,
    #[serde(default = "default_missing_transfer_attempts")]
    pub missing_transfer_attempts: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_page_limit() -> u32 {
    20
}

fn default_max_pages_per_cycle() -> u32 {
    5
}

fn default_lookback_rounds() -> u64 {
    10
}

fn default_auto_start_lookback() -> u64 {
    4_000
}

fn default_missing_transfer_attempts() -> u32 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Destination chain (Algorand) section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub algod_url: Url,
    #[serde(default)]
    pub algod_token: Option<String>,
    pub indexer_url: Url,
    #[serde(default)]
    pub indexer_token: Option<String>,
    pub escrow_app_id: u64,
    pub asset_id: u64,
    #[serde(default = "default_fee_microalgos")]
    pub fee_microalgos: u64,
    /// Rounds a withdrawal stays valid after it is built.
    #[serde(default = "default_validity_rounds")]
    pub validity_rounds: u64,
    #[serde(default = "default_note_prefix")]
    pub note_prefix: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_fee_microalgos() -> u64 {
    4_000
}

fn default_validity_rounds() -> u64 {
    12
}

fn default_note_prefix() -> String {
    "voibridge:".to_string()
}

/// Remote signer section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerConfig {
    pub url: Url,
    pub key_handle: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Deposit amount limits, in base units of the source asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_min_amount")]
    pub min_amount: u64,
    #[serde(default = "default_max_amount")]
    pub max_amount: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            min_amount: default_min_amount(),
            max_amount: default_max_amount(),
        }
    }
}

fn default_min_amount() -> u64 {
    1
}

fn default_max_amount() -> u64 {
    i64::MAX as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    20
}

fn default_confirmation_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    6
}

fn default_backoff_initial_ms() -> u64 {
    2_000
}

fn default_backoff_max_ms() -> u64 {
    180_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,
    #[serde(default = "default_resubmit_after_secs")]
    pub resubmit_after_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
            stale_claim_secs: default_stale_claim_secs(),
            resubmit_after_secs: default_resubmit_after_secs(),
            batch_limit: default_batch_limit(),
        }
    }
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_grace_period_secs() -> u64 {
    120
}

fn default_stale_claim_secs() -> u64 {
    600
}

fn default_resubmit_after_secs() -> u64 {
    300
}

fn default_batch_limit() -> u32 {
    100
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MINIMAL: &str = r#"
[source]
indexer_urls = ["https://mainnet-idx.voi.nodely.dev", "https://voi-mainnet-indexer.example.org"]
validator_app_id = 40123456
log_prefix = "vb:dep:"
asset_id = 302190
treasury_address = "VKVKVKVKVKVKVKVKVKVKVKVKVKVKVKVKVKVKVKVKVKVKVKVKVKVLISMS5Y"

[destination]
algod_url = "https://mainnet-api.4160.nodely.dev"
indexer_url = "https://mainnet-idx.4160.nodely.dev"
escrow_app_id = 2987654321
asset_id = 31566704

[signer]
url = "http://127.0.0.1:9100"
key_handle = "relayer-hot"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: FileConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.server.listen, default_listen_addr());
        assert_eq!(config.source.indexer_urls.len(), 2);
        assert_eq!(config.source.page_limit, 20);
        assert_eq!(config.source.max_pages_per_cycle, 5);
        assert_eq!(config.source.auto_start_lookback, 4_000);
        assert_eq!(config.source.missing_transfer_attempts, 10);
        assert_eq!(config.source.start_round, None);
        assert_eq!(config.destination.fee_microalgos, 4_000);
        assert_eq!(config.destination.validity_rounds, 12);
        assert_eq!(config.pipeline.poll_interval_secs, 20);
        assert_eq!(config.pipeline.backoff_max_ms, 180_000);
        assert_eq!(config.bridge.min_amount, 1);
        assert_eq!(config.reconciler.batch_limit, 100);
        assert!(config.signer.auth_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let toml_str = format!(
            "{MINIMAL}\n[server]\nlisten = \"0.0.0.0:3000\"\n\n[bridge]\nmin_amount = 100\nmax_amount = 5000\n\n[pipeline]\npoll_interval_secs = 5\n"
        );
        let config: FileConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.server.listen.port(), 3000);
        assert_eq!(config.bridge.max_amount, 5_000);
        assert_eq!(config.pipeline.poll_interval_secs, 5);
        assert_eq!(config.pipeline.max_retries, 6);
    }

    #[test]
    fn test_missing_section_is_an_error() {
        let toml_str = MINIMAL.replace("[signer]", "[unused]");
        assert!(toml::from_str::<FileConfig>(&toml_str).is_err());
    }
}
