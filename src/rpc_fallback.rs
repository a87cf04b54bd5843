//! JSON-RPC over HTTP with ordered endpoint fallback
//!
//! Adapter sidecars and the home node both speak plain JSON-RPC 2.0. The first
//! URL is the primary; transport failures move on to the next one, while an
//! error answered by the server is returned as is.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use eyre::{Result, WrapErr};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcCallError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

pub struct JsonRpcTransport {
    client: Client,
    urls: Vec<String>,
    next_id: AtomicU64,
}

impl JsonRpcTransport {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self> {
        if urls.is_empty() {
            return Err(eyre::eyre!("At least one RPC URL is required"));
        }
        for url in &urls {
            reqwest::Url::parse(url).wrap_err_with(|| format!("Invalid RPC URL: {}", url))?;
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("Failed to build HTTP client")?;
        Ok(Self {
            client,
            urls,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Call `method`, trying each endpoint in order on transport failure
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> std::result::Result<Option<T>, RpcCallError> {
        let mut last_error = None;
        for url in &self.urls {
            match self.call_one(url, method, &params).await {
                Err(RpcCallError::Transport(error)) => {
                    warn!(url = %url, method = method, error = %error, "RPC endpoint failed, trying next");
                    last_error = Some(error);
                }
                other => return other,
            }
        }
        Err(RpcCallError::Transport(
            last_error.unwrap_or_else(|| "no RPC endpoints configured".to_string()),
        ))
    }

    async fn call_one<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: &serde_json::Value,
    ) -> std::result::Result<Option<T>, RpcCallError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcCallError::Transport(e.to_string()))?
            .json::<RpcResponse<T>>()
            .await
            .map_err(|e| RpcCallError::Transport(e.to_string()))?;

        if let Some(error) = response.error {
            return Err(RpcCallError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result)
    }
}
