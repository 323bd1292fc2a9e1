//! algod REST objects.

use serde::{Deserialize, Serialize};

/// `GET /v2/transactions/params`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransactionParams {
    pub fee: u64,
    pub min_fee: u64,
    pub last_round: u64,
    pub genesis_id: String,
    /// Base64 genesis hash.
    pub genesis_hash: String,
}

/// `GET /v2/transactions/pending/{txid}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PendingTransaction {
    #[serde(default)]
    pub confirmed_round: Option<u64>,
    /// Non-empty when the node evicted the transaction from its pool.
    #[serde(default)]
    pub pool_error: String,
}

/// `GET /v2/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeStatus {
    pub last_round: u64,
}

/// `POST /v2/transactions`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    #[serde(rename = "txId")]
    pub tx_id: String,
}

/// `GET /v2/applications/{application-id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: u64,
    pub params: ApplicationParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApplicationParams {
    #[serde(default)]
    pub global_state: Vec<TealKeyValue>,
}

/// One global-state entry. `key` is base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TealKeyValue {
    pub key: String,
    pub value: TealValue,
}

/// `type` is 1 for bytes, 2 for uint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TealValue {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub bytes: String,
    #[serde(default)]
    pub uint: u64,
}

impl ApplicationParams {
    /// Uint value stored under the global key `name`; absent keys read as 0,
    /// as they do on chain.
    pub fn global_uint(&self, name: &str) -> u64 {
        let key = crate::encoding::b64_encode(name.as_bytes());
        self.global_state
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.uint)
            .unwrap_or(0)
    }
}

/// Error body returned by algod for non-2xx responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_transaction_defaults() {
        let pending: PendingTransaction = serde_json::from_str(r#"{"pool-error": ""}"#).unwrap();
        assert_eq!(pending.confirmed_round, None);
        assert!(pending.pool_error.is_empty());

        let confirmed: PendingTransaction =
            serde_json::from_str(r#"{"confirmed-round": 812, "pool-error": ""}"#).unwrap();
        assert_eq!(confirmed.confirmed_round, Some(812));
    }

    #[test]
    fn test_application_global_uint() {
        let app: Application = serde_json::from_str(
            r#"{"id": 555, "params": {"global-state": [
                {"key": "bm9uY2U=", "value": {"type": 2, "uint": 17}},
                {"key": "YWRtaW4=", "value": {"type": 1, "bytes": "AAAA"}}
            ]}}"#,
        )
        .unwrap();
        assert_eq!(app.params.global_uint("nonce"), 17);
        assert_eq!(app.params.global_uint("missing"), 0);

        let fresh: Application = serde_json::from_str(r#"{"id": 555, "params": {}}"#).unwrap();
        assert_eq!(fresh.params.global_uint("nonce"), 0);
    }

    #[test]
    fn test_submit_response_field_name() {
        let resp: SubmitResponse = serde_json::from_str(r#"{"txId": "ABC"}"#).unwrap();
        assert_eq!(resp.tx_id, "ABC");
    }
}
