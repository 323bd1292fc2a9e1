//! algod client.

use bytes::Bytes;
use reqwest::Client;
use url::Url;

use super::{ClientError, parse_response};
use crate::objects::algod::{Application, NodeStatus, PendingTransaction, SubmitResponse, TransactionParams};

const TOKEN_HEADER: &str = "X-Algo-API-Token";

/// Typed client for an algod node.
#[derive(Debug, Clone)]
pub struct AlgodClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl AlgodClient {
    pub fn new(base_url: Url, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url,
            token,
        }
    }

    /// Replace the default `reqwest::Client` with a custom one.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    fn get(&self, path: &str) -> Result<reqwest::RequestBuilder, ClientError> {
        let url = self.base_url.join(path)?;
        let mut req = self.http.get(url);
        if let Some(token) = &self.token {
            req = req.header(TOKEN_HEADER, token);
        }
        Ok(req)
    }

    /// `GET /v2/transactions/params`
    pub async fn transaction_params(&self) -> Result<TransactionParams, ClientError> {
        let resp = self.get("/v2/transactions/params")?.send().await?;
        parse_response(resp).await
    }

    /// `GET /v2/status`
    pub async fn status(&self) -> Result<NodeStatus, ClientError> {
        let resp = self.get("/v2/status")?.send().await?;
        parse_response(resp).await
    }

    /// `GET /v2/applications/{app_id}`
    pub async fn application(&self, app_id: u64) -> Result<Application, ClientError> {
        let resp = self.get(&format!("/v2/applications/{app_id}"))?.send().await?;
        parse_response(resp).await
    }

    /// `POST /v2/transactions` with raw msgpack bytes.
    pub async fn send_raw_transaction(&self, signed: Bytes) -> Result<SubmitResponse, ClientError> {
        let url = self.base_url.join("/v2/transactions")?;
        let mut req = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-binary")
            .body(signed);
        if let Some(token) = &self.token {
            req = req.header(TOKEN_HEADER, token);
        }
        let resp = req.send().await?;
        parse_response(resp).await
    }

    /// `GET /v2/transactions/pending/{txid}`. `None` when the node has no
    /// record of the transaction.
    pub async fn pending_transaction(
        &self,
        txid: &str,
    ) -> Result<Option<PendingTransaction>, ClientError> {
        let resp = self
            .get(&format!("/v2/transactions/pending/{txid}"))?
            .send()
            .await?;
        match parse_response(resp).await {
            Ok(pending) => Ok(Some(pending)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `GET /v2/accounts/{address}/assets/{asset_id}`. An account that has
    /// not opted in to the asset yields 404, reported here as `false`.
    pub async fn is_opted_in(&self, address: &str, asset_id: u64) -> Result<bool, ClientError> {
        let resp = self
            .get(&format!("/v2/accounts/{address}/assets/{asset_id}"))?
            .send()
            .await?;
        match parse_response::<serde_json::Value>(resp).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
