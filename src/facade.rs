//! Resilience context
//!
//! One explicitly constructed object owns the request pool and the
//! subscription manager for the process. Consumers receive it by reference
//! (usually inside an `Arc`) instead of reaching for a global.
//!
//! Lifecycle: `init` builds and starts both channels, tearing down whatever a
//! previous `init` left running. Accessors fail with `NotInitialized` until
//! then. `stop` is idempotent.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::config::ResilienceConfig;
use crate::envelope::{RpcReply, RpcRequest};
use crate::error::{ResilienceError, Result};
use crate::request::{HttpConnector, RequestPool, RpcClient, RpcConnector};
use crate::rotation::Endpoint;
use crate::stream::{StreamConnector, SubscriptionIntent, SubscriptionManager, WsConnector};

/// Transport factories for both channels.
#[derive(Clone)]
pub struct Connectors {
    pub stream: Arc<dyn StreamConnector>,
    pub rpc: Arc<dyn RpcConnector>,
}

impl Connectors {
    /// tokio-tungstenite for streaming, reqwest for requests.
    pub fn production(config: &ResilienceConfig) -> Self {
        Self {
            stream: Arc::new(WsConnector),
            rpc: Arc::new(HttpConnector::new(config.pool_config().request_timeout)),
        }
    }
}

struct Active {
    pool: Arc<RequestPool>,
    subscriptions: Arc<SubscriptionManager>,
}

impl Active {
    async fn shutdown(self) {
        self.pool.stop();
        self.subscriptions.stop().await;
    }
}

#[derive(Default)]
pub struct ResilienceContext {
    active: RwLock<Option<Active>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ResilienceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn init(
        &self,
        config: &ResilienceConfig,
        intent: Arc<dyn SubscriptionIntent>,
    ) -> Result<()> {
        self.init_with(config, Connectors::production(config), intent)
            .await
    }

    pub async fn init_with(
        &self,
        config: &ResilienceConfig,
        connectors: Connectors,
        intent: Arc<dyn SubscriptionIntent>,
    ) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let tables = config
            .validate()
            .and_then(|_| Ok((config.request_table()?, config.stream_table()?)));
        let (request_table, stream_table) = match tables {
            Ok(tables) => tables,
            Err(e) => {
                error!(error = %e, "resilience context init rejected");
                return Err(e);
            }
        };

        let previous = self.active.write().take();
        if let Some(previous) = previous {
            warn!("resilience context re-initialized, stopping previous channels");
            previous.shutdown().await;
        }

        let pool = RequestPool::new(request_table, connectors.rpc, config.pool_config());
        let subscriptions = SubscriptionManager::new(
            stream_table,
            connectors.stream,
            config.manager_config(),
            intent,
        );
        pool.start();
        subscriptions.start();

        info!(
            request_endpoints = config.request_endpoints.len(),
            stream_endpoints = config.stream_endpoints.len(),
            "resilience_context_initialized"
        );
        *self.active.write() = Some(Active {
            pool,
            subscriptions,
        });
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.active.read().is_some()
    }

    fn with_active<T>(&self, accessor: &'static str, f: impl FnOnce(&Active) -> T) -> Result<T> {
        match self.active.read().as_ref() {
            Some(active) => Ok(f(active)),
            None => {
                error!(accessor, "resilience context used before init");
                Err(ResilienceError::NotInitialized)
            }
        }
    }

    pub fn request_pool(&self) -> Result<Arc<RequestPool>> {
        self.with_active("request_pool", |a| Arc::clone(&a.pool))
    }

    /// Current request client, or `NotReady` while the pool reconnects.
    pub fn client(&self) -> Result<Arc<RpcClient>> {
        self.request_pool()?.get_client()
    }

    pub fn subscriptions(&self) -> Result<Arc<SubscriptionManager>> {
        self.with_active("subscriptions", |a| Arc::clone(&a.subscriptions))
    }

    /// Streaming endpoint the subscription manager is bound to.
    pub fn current_endpoint(&self) -> Result<Endpoint> {
        self.with_active("current_endpoint", |a| a.subscriptions.current_endpoint())
    }

    pub fn current_request_endpoint(&self) -> Result<Endpoint> {
        self.with_active("current_request_endpoint", |a| a.pool.current_endpoint())
    }

    pub async fn call(&self, request: &RpcRequest) -> Result<RpcReply> {
        self.request_pool()?.call(request).await
    }

    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let active = self.active.write().take();
        if let Some(active) = active {
            active.shutdown().await;
            info!("resilience_context_stopped");
        }
    }
}
