//! HTTP client for the channel platform's merchant API.
//!
//! Products are created or overwritten through one bulk endpoint; partial
//! attribute writes are not supported, so every call carries the full
//! payload. Deletion is a single-item endpoint keyed by MerchantProductNo.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::warn;

use crate::model::Account;
use crate::remote::model::{BulkResponse, DeleteResponse};

pub mod model;

/// Marker the platform puts in the error body of a delete for a product it
/// does not know. Used to classify the delete as already-done.
const NOT_FOUND_MARKER: &str = "could not be found";

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The platform rejected the request itself (4xx with an error body).
    /// Permanent from the connector's point of view.
    #[error("channel api rejected the request ({status}): {body}")]
    Api { status: u16, body: String },
    /// Connectivity failure or a server-side condition (5xx, 429). The
    /// whole job is worth retrying later; per-binding outcomes must not be
    /// touched.
    #[error("transient channel error: {0}")]
    Transient(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// Delete responses for unknown products carry a recognizable body; the
    /// delete flow treats those as already-removed.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Api { body, .. } if body.contains(NOT_FOUND_MARKER))
    }
}

/// Map an unsuccessful HTTP status to the error taxonomy. 429 and 5xx are
/// retry-worthy server conditions; everything else is a structured
/// rejection of this particular request.
fn classify_status(status: StatusCode, body: String) -> RemoteError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        RemoteError::Transient(format!("status {status}: {body}"))
    } else {
        RemoteError::Api {
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
pub trait ChannelApi: Send + Sync {
    /// Bulk create-or-update. `items` already contains the synthesized
    /// parent entries.
    async fn create_or_update(
        &self,
        account: &Account,
        items: &[Value],
    ) -> Result<BulkResponse, RemoteError>;

    /// Single-item delete by external key.
    async fn delete(
        &self,
        account: &Account,
        merchant_product_no: &str,
    ) -> Result<DeleteResponse, RemoteError>;
}

#[derive(Clone)]
pub struct ChannelClient {
    http: Client,
}

impl fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelClient").finish_non_exhaustive()
    }
}

impl Default for ChannelClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelClient {
    pub fn new() -> Self {
        let http = Client::builder()
            .user_agent("channel-syncbot/0.1")
            .build()
            .unwrap_or_default();
        Self { http }
    }

    fn endpoint(&self, account: &Account, path: &str) -> Result<Url, RemoteError> {
        let base = Url::parse(&account.host).map_err(|e| RemoteError::Api {
            status: 0,
            body: format!("invalid account host {}: {}", account.host, e),
        })?;
        let mut url = base.join(path).map_err(|e| RemoteError::Api {
            status: 0,
            body: format!("invalid endpoint path {path}: {e}"),
        })?;
        url.query_pairs_mut().append_pair("apikey", &account.api_key);
        Ok(url)
    }
}

#[async_trait]
impl ChannelApi for ChannelClient {
    async fn create_or_update(
        &self,
        account: &Account,
        items: &[Value],
    ) -> Result<BulkResponse, RemoteError> {
        let url = self.endpoint(account, "v2/products")?;
        let res = self
            .http
            .post(url)
            .json(items)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, account = %account.name, "bulk export rejected");
            return Err(classify_status(status, body));
        }
        res.json::<BulkResponse>()
            .await
            .map_err(|e| RemoteError::Transient(format!("unreadable bulk response: {e}")))
    }

    async fn delete(
        &self,
        account: &Account,
        merchant_product_no: &str,
    ) -> Result<DeleteResponse, RemoteError> {
        let url = self.endpoint(account, &format!("v2/products/{merchant_product_no}"))?;
        let res = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        res.json::<DeleteResponse>()
            .await
            .map_err(|e| RemoteError::Transient(format!("unreadable delete response: {e}")))
    }
}
