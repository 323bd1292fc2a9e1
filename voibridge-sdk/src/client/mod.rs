//! HTTP clients for the services the relayer talks to.
//!
//! Gated behind the `client` cargo feature so crates that only need the wire
//! types do not pull in `reqwest`.

mod algod;
mod indexer;
mod signer;

pub use algod::AlgodClient;
pub use indexer::IndexerClient;
pub use signer::SignerClient;

use reqwest::StatusCode;

use crate::objects::algod::ErrorResponse;

/// Errors produced by the SDK HTTP clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure (DNS, TLS, connection reset, …).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("api error: status {status}, body: {body}")]
    Api { status: StatusCode, body: String },

    /// Response body could not be deserialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The base URL could not be joined with the endpoint path.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// A client was built without any endpoint to talk to.
    #[error("no endpoint configured")]
    NoEndpoint,
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }

    /// Whether retrying the same request against another endpoint might help.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(_) => true,
            ClientError::Api { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// The human readable message of an API error, unwrapped from the JSON
    /// `{"message": ...}` envelope when present.
    pub fn api_message(&self) -> Option<String> {
        match self {
            ClientError::Api { body, .. } => Some(
                serde_json::from_str::<ErrorResponse>(body)
                    .map(|e| e.message)
                    .unwrap_or_else(|_| body.clone()),
            ),
            _ => None,
        }
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::Api { status, body });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(ClientError::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_message_unwraps_envelope() {
        let err = ClientError::Api {
            status: StatusCode::BAD_REQUEST,
            body: r#"{"message":"TransactionPool.Remember: transaction ABC: overspend"}"#.into(),
        };
        assert_eq!(
            err.api_message().as_deref(),
            Some("TransactionPool.Remember: transaction ABC: overspend")
        );
        assert!(!err.is_retryable());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_retryable_statuses() {
        let busy = ClientError::Api {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        assert!(busy.is_retryable());
        let missing = ClientError::Api {
            status: StatusCode::NOT_FOUND,
            body: "plain".into(),
        };
        assert!(missing.is_not_found());
        assert_eq!(missing.api_message().as_deref(), Some("plain"));
    }
}
