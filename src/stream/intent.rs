//! Subscription intent
//!
//! The caller owns the list of subscribe requests it wants active. The manager
//! only reads it, in order, each time a fresh connection opens.

use parking_lot::RwLock;

use crate::envelope::RpcRequest;

pub trait SubscriptionIntent: Send + Sync {
    /// Requests to (re)issue on a new connection, in issue order.
    fn messages(&self) -> Vec<RpcRequest>;
}

impl SubscriptionIntent for Vec<RpcRequest> {
    fn messages(&self) -> Vec<RpcRequest> {
        self.clone()
    }
}

/// Mutable intent shared between the caller and the manager.
#[derive(Debug, Default)]
pub struct IntentSet {
    requests: RwLock<Vec<RpcRequest>>,
}

impl IntentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requests(requests: impl IntoIterator<Item = RpcRequest>) -> Self {
        let set = Self::new();
        for request in requests {
            set.add(request);
        }
        set
    }

    /// Appends unless an identical request is already present.
    pub fn add(&self, request: RpcRequest) -> bool {
        let mut requests = self.requests.write();
        if requests.contains(&request) {
            return false;
        }
        requests.push(request);
        true
    }

    pub fn remove(&self, request: &RpcRequest) -> bool {
        let mut requests = self.requests.write();
        let before = requests.len();
        requests.retain(|r| r != request);
        requests.len() != before
    }

    pub fn clear(&self) {
        self.requests.write().clear();
    }

    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.read().is_empty()
    }
}

impl SubscriptionIntent for IntentSet {
    fn messages(&self) -> Vec<RpcRequest> {
        self.requests.read().clone()
    }
}
