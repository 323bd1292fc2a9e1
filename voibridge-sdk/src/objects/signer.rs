//! Remote signer objects.
//!
//! The relayer never holds key material. It describes the application call it
//! wants and a signing service, addressed by key handle, returns the signed
//! transaction bytes and the transaction id.

use serde::{Deserialize, Serialize};

/// `GET /v1/keys/{handle}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub address: String,
}

/// `POST /v1/keys/{handle}/sign` request body: an unsigned NoOp application call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignApplicationCallRequest {
    pub app_id: u64,
    /// Base64 application arguments.
    pub app_args: Vec<String>,
    pub accounts: Vec<String>,
    pub foreign_assets: Vec<u64>,
    /// Base64 note.
    pub note: String,
    /// Flat fee in microalgos.
    pub fee: u64,
    pub first_valid: u64,
    pub last_valid: u64,
    pub genesis_id: String,
    /// Base64 genesis hash.
    pub genesis_hash: String,
}

/// `POST /v1/keys/{handle}/sign` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    pub tx_id: String,
    /// Base64 msgpack-encoded signed transaction, ready for `POST /v2/transactions`.
    pub signed_transaction: String,
}
