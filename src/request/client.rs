//! Request client bound to a single endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::envelope::{InboundMessage, NodeVersion, RpcReply, RpcRequest};
use crate::error::{ResilienceError, Result};
use crate::rotation::Endpoint;

use super::transport::RpcTransport;

pub struct RpcClient {
    endpoint: Endpoint,
    transport: Arc<dyn RpcTransport>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    pub fn new(endpoint: Endpoint, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            endpoint,
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn call(&self, request: &RpcRequest) -> Result<RpcReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reply = self
            .transport
            .exchange(request.to_envelope(id))
            .await
            .map_err(|e| ResilienceError::transport(self.endpoint.uri(), &e))?;

        match InboundMessage::from_value(reply) {
            InboundMessage::Reply { id: got, result } if got == id => {
                request.decode_result(result)
            }
            InboundMessage::Reply { id: got, .. } => Err(ResilienceError::UnexpectedReply(
                format!("reply id {got} for request {id}"),
            )),
            InboundMessage::Failure { code, message, .. } => {
                Err(ResilienceError::Rpc { code, message })
            }
            other => Err(ResilienceError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Minimal liveness query.
    pub async fn version(&self) -> Result<NodeVersion> {
        match self.call(&RpcRequest::GetVersion).await? {
            RpcReply::Version(v) => Ok(v),
            other => Err(ResilienceError::UnexpectedReply(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::transport::RpcConnector;
    use crate::test_support::MockRpcConnector;

    fn client(connector: &MockRpcConnector, uri: &str) -> RpcClient {
        let endpoint = Endpoint::new(uri, 0);
        let transport = connector.open(&endpoint).unwrap();
        RpcClient::new(endpoint, transport)
    }

    #[tokio::test]
    async fn test_call_decodes_reply() {
        let connector = MockRpcConnector::new();
        let c = client(&connector, "https://a");

        assert_eq!(c.version().await.unwrap().core, "1.18.0");
        assert_eq!(
            c.call(&RpcRequest::GetSlot { commitment: None }).await.unwrap(),
            RpcReply::Slot(42)
        );
    }

    #[tokio::test]
    async fn test_errors_are_classified() {
        let connector = MockRpcConnector::new();
        let c = client(&connector, "https://a");

        let unknown = c
            .call(&RpcRequest::Custom {
                method: "noSuchMethod".into(),
                params: serde_json::json!([]),
            })
            .await
            .unwrap_err();
        assert!(matches!(unknown, ResilienceError::Rpc { code: -32601, .. }));
        assert!(!unknown.is_endpoint_failure());

        connector.set_down("https://a", true);
        let down = c.version().await.unwrap_err();
        assert!(matches!(down, ResilienceError::Transport { .. }));
        assert!(down.is_endpoint_failure());
    }
}
