//! Remote signing service client.

use reqwest::Client;
use url::Url;

use super::{ClientError, parse_response};
use crate::objects::signer::{KeyInfo, SignApplicationCallRequest, SignResponse};

/// Typed client for the remote signer. The relayer only knows a key handle;
/// the service owns the key.
#[derive(Debug, Clone)]
pub struct SignerClient {
    http: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl SignerClient {
    pub fn new(base_url: Url, bearer_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url,
            bearer_token,
        }
    }

    /// Replace the default `reqwest::Client` with a custom one.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// `GET /v1/keys/{handle}`
    pub async fn key_info(&self, handle: &str) -> Result<KeyInfo, ClientError> {
        let url = self.base_url.join(&format!("/v1/keys/{handle}"))?;
        let mut req = self.http.get(url);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        parse_response(resp).await
    }

    /// `POST /v1/keys/{handle}/sign`
    pub async fn sign_application_call(
        &self,
        handle: &str,
        request: &SignApplicationCallRequest,
    ) -> Result<SignResponse, ClientError> {
        let url = self.base_url.join(&format!("/v1/keys/{handle}/sign"))?;
        let mut req = self.http.post(url).json(request);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        parse_response(resp).await
    }
}
