//! Indexer (`/v2/transactions`) response objects.
//!
//! Only the fields the relayer reads are modelled; everything else in the
//! indexer payload is ignored.

use serde::{Deserialize, Serialize};

/// One page of `GET /v2/transactions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransactionsPage {
    /// The round the indexer has caught up to.
    pub current_round: u64,
    #[serde(default)]
    pub next_token: Option<String>,
    #[serde(default)]
    pub transactions: Vec<IndexerTransaction>,
}

/// Response of `GET /v2/transactions/{txid}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransactionLookup {
    pub current_round: u64,
    pub transaction: IndexerTransaction,
}

/// A confirmed transaction as returned by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndexerTransaction {
    pub id: String,
    pub sender: String,
    #[serde(default)]
    pub confirmed_round: Option<u64>,
    #[serde(default)]
    pub intra_round_offset: Option<u32>,
    /// Base64 group id, present when the transaction was part of a group.
    #[serde(default)]
    pub group: Option<String>,
    /// Base64 note.
    #[serde(default)]
    pub note: Option<String>,
    /// Base64 log lines emitted by an application call.
    #[serde(default)]
    pub logs: Vec<String>,
    pub tx_type: String,
    #[serde(default)]
    pub asset_transfer_transaction: Option<AssetTransferFields>,
    #[serde(default)]
    pub application_transaction: Option<ApplicationCallFields>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AssetTransferFields {
    pub asset_id: u64,
    pub amount: u64,
    pub receiver: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApplicationCallFields {
    pub application_id: u64,
    /// Base64 application arguments.
    #[serde(default)]
    pub application_args: Vec<String>,
}

/// Query parameters for `GET /v2/transactions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransactionSearch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// `sender`, `receiver` or `freeze-target`; qualifies `address`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_round: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_type: Option<String>,
    /// Base64 note prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}
