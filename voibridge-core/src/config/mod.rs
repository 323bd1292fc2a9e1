//! Validated runtime configuration.
//!
//! These types are built by the relayer binary from its TOML file and handed
//! to the pipeline components. Parsing and validation live in the binary.

use std::time::Duration;

use url::Url;
use voibridge_sdk::Address;

use crate::utils::backoff::RetryPolicy;

/// Source chain (VOI) indexer and validator contract.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Tried in order; later URLs are fallbacks.
    pub indexer_urls: Vec<Url>,
    pub indexer_token: Option<String>,
    pub validator_app_id: u64,
    pub log_prefix: Vec<u8>,
    /// Source ASA the deposits must transfer.
    pub asset_id: u64,
    /// Treasury account that must receive the deposit transfer.
    pub treasury: Address,
    pub page_limit: u32,
    pub max_pages_per_cycle: u32,
    /// Rounds re-scanned below the cursor on every cycle.
    pub lookback_rounds: u64,
    /// Where to start on an empty database.
    pub start_round: Option<u64>,
    /// Without `start_round`, start this many rounds behind the indexer head.
    pub auto_start_lookback: u64,
    /// Scans a deposit's transfer may be missing from the indexer before the
    /// deposit is treated as having none.
    pub missing_transfer_attempts: u32,
    pub request_timeout: Duration,
}

/// Destination chain (Algorand) node, indexer and escrow.
#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub algod_url: Url,
    pub algod_token: Option<String>,
    pub indexer_url: Url,
    pub indexer_token: Option<String>,
    pub escrow_app_id: u64,
    pub asset_id: u64,
    /// Flat fee for the withdraw call, covering the inner transfer.
    pub fee_microalgos: u64,
    /// Validity window of a withdrawal transaction, in rounds.
    pub validity_rounds: u64,
    pub note_prefix: Vec<u8>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SignerConfig {
    pub url: Url,
    pub key_handle: String,
    pub auth_token: Option<String>,
}

/// Business limits applied to every deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeRules {
    pub min_amount: u64,
    pub max_amount: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub poll_interval: Duration,
    /// How long the executor waits for a broadcast withdrawal to confirm.
    pub confirmation_timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Minimum age before a Seen or Submitted record is inspected.
    pub grace_period: Duration,
    /// Age after which a Claimed record is considered abandoned.
    pub stale_claim_after: Duration,
    /// Minimum age of an expired submission before it is sent again.
    pub resubmit_after: Duration,
    pub batch_limit: u32,
}
