//! Privacy-group payload distribution.
//!
//! A private transaction only carries a reference key on chain. Before it
//! is signed, the payload is stored on every configured transaction manager
//! through `POST {url}/storeraw`; all of them must derive the same key.

use core_logic::PayloadError;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize)]
struct StoreRawRequest<'a> {
    payload: &'a str,
    from: &'a str,
}

#[derive(Debug, Deserialize)]
struct StoreRawResponse {
    key: String,
}

/// Client for one transaction manager's public HTTP API.
#[derive(Debug, Clone)]
pub struct TransactionManagerClient {
    url: String,
    http: reqwest::Client,
}

impl TransactionManagerClient {
    pub fn new(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stores a base64 payload and returns the key the manager derived.
    pub async fn store_raw(&self, from: &str, payload: &str) -> Result<String, PayloadError> {
        let request_error = |reason: String| PayloadError::Request {
            url: self.url.clone(),
            reason,
        };

        let response = self
            .http
            .post(format!("{}/storeraw", self.url))
            .json(&StoreRawRequest { payload, from })
            .send()
            .await
            .map_err(|e| request_error(e.to_string()))?
            .error_for_status()
            .map_err(|e| request_error(e.to_string()))?;

        let body: StoreRawResponse = response
            .json()
            .await
            .map_err(|e| request_error(format!("invalid storeraw response: {}", e)))?;

        debug!(url = %self.url, key = %body.key, "Payload stored");
        Ok(body.key)
    }
}

/// Distributes payloads to a set of transaction managers.
#[derive(Debug, Clone)]
pub struct PayloadDistributor {
    from: String,
    managers: Vec<TransactionManagerClient>,
}

impl PayloadDistributor {
    pub fn new(from: impl Into<String>, urls: &[String]) -> Self {
        let http = reqwest::Client::new();
        Self {
            from: from.into(),
            managers: urls
                .iter()
                .map(|url| TransactionManagerClient::new(url.as_str(), http.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Stores `payload` on every manager in turn and returns their common
    /// key. The first failure or disagreement aborts; no partial key is
    /// returned.
    pub async fn distribute_payload(&self, payload: &str) -> Result<String, PayloadError> {
        let mut expected: Option<String> = None;

        for manager in &self.managers {
            let key = manager.store_raw(&self.from, payload).await?;
            match &expected {
                None => expected = Some(key),
                Some(first) if *first != key => {
                    return Err(PayloadError::ConsistencyMismatch {
                        url: manager.url().to_string(),
                        got: key,
                        expected: first.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        expected.ok_or(PayloadError::NoTransactionManagers)
    }
}
