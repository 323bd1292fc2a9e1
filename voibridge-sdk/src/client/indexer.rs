//! Indexer client with ordered endpoint fallback.

use reqwest::Client;
use url::Url;

use super::{ClientError, parse_response};
use crate::objects::indexer::{TransactionLookup, TransactionSearch, TransactionsPage};

const TOKEN_HEADER: &str = "X-Indexer-API-Token";

/// Typed client for an Algorand-compatible indexer.
///
/// Requests go to the first endpoint; transport errors, 5xx and 429
/// responses fall through to the next one. The last error is returned when
/// every endpoint fails.
#[derive(Debug, Clone)]
pub struct IndexerClient {
    http: Client,
    endpoints: Vec<Url>,
    token: Option<String>,
}

impl IndexerClient {
    pub fn new(endpoints: Vec<Url>, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            endpoints,
            token,
        }
    }

    /// Replace the default `reqwest::Client` with a custom one.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// `GET /v2/transactions`
    pub async fn search_transactions(
        &self,
        search: &TransactionSearch,
    ) -> Result<TransactionsPage, ClientError> {
        let mut last_err = ClientError::NoEndpoint;
        for base in &self.endpoints {
            let url = base.join("/v2/transactions")?;
            let mut req = self.http.get(url).query(search);
            if let Some(token) = &self.token {
                req = req.header(TOKEN_HEADER, token);
            }
            let result = match req.send().await {
                Ok(resp) => parse_response(resp).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// `GET /v2/transactions/{txid}`. Returns `None` when no endpoint knows
    /// the transaction.
    pub async fn lookup_transaction(
        &self,
        txid: &str,
    ) -> Result<Option<TransactionLookup>, ClientError> {
        let mut last_err = ClientError::NoEndpoint;
        for base in &self.endpoints {
            let url = base.join(&format!("/v2/transactions/{txid}"))?;
            let mut req = self.http.get(url);
            if let Some(token) = &self.token {
                req = req.header(TOKEN_HEADER, token);
            }
            let result = match req.send().await {
                Ok(resp) => parse_response(resp).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(found) => return Ok(Some(found)),
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) if e.is_retryable() => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}
