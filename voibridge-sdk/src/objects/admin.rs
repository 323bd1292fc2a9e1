//! Operator API objects.

use serde::{Deserialize, Serialize};

/// Maximum page size for record listings.
pub const MAX_PAGE_SIZE: u32 = 500;
/// Default page size when none is given.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Deduplication record status as exposed by the operator API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Seen,
    Claimed,
    Submitted,
    Settled,
    Rejected,
}

/// Query string for `GET /v1/records`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRecordsQuery {
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// Clamp optional pagination parameters into `(limit, offset)`.
pub fn clamp_pagination(limit: Option<u32>, offset: Option<u32>) -> (u32, u32) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    (limit, offset.unwrap_or(0))
}

/// One deduplication record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordView {
    pub deposit_id: String,
    pub status: RecordStatus,
    /// Destination transaction id for submitted and settled records.
    pub tx_ref: Option<String>,
    /// Rejection reason for rejected records.
    pub reason: Option<String>,
    pub source_txid: String,
    pub source_round: u64,
    pub intra_round_offset: u32,
    pub log_index: u32,
    pub destination: Option<String>,
    pub amount: Option<u64>,
    pub nonce: Option<u64>,
    pub attempts: u32,
    pub first_seen_at: i64,
    pub claimed_at: Option<i64>,
    pub updated_at: i64,
}

/// `GET /v1/watermark`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkView {
    pub watermark: Option<u64>,
    pub scan_cursor: Option<u64>,
    pub lowest_unresolved_round: Option<u64>,
}
