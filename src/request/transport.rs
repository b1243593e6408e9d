//! Request transport seam
//!
//! `RpcConnector::open` is synchronous and cheap; it only builds a handle.
//! Whether the endpoint actually answers is decided by the first exchange.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::rotation::Endpoint;

#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send one JSON-RPC envelope and return the reply envelope.
    async fn exchange(&self, request: Value) -> Result<Value>;
}

pub trait RpcConnector: Send + Sync {
    fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn RpcTransport>>;
}

/// Builds pooled reqwest clients, one per endpoint.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl RpcConnector for HttpConnector {
    fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn RpcTransport>> {
        let client = Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to build RPC http client")?;

        Ok(Arc::new(HttpTransport {
            client,
            url: endpoint.uri().to_string(),
        }))
    }
}

struct HttpTransport {
    client: Client,
    url: String,
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn exchange(&self, request: Value) -> Result<Value> {
        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("POST {} {}: {}", self.url, status, text));
        }

        resp.json::<Value>()
            .await
            .with_context(|| format!("Invalid JSON from {}", self.url))
    }
}
