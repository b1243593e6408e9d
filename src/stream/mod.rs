//! Streaming (subscription) channel

pub mod intent;
pub mod manager;
pub mod session;
pub mod transport;

pub use intent::{IntentSet, SubscriptionIntent};
pub use manager::{ManagerConfig, SubscriptionManager};
pub use session::{SessionConfig, SubscriptionSession};
pub use transport::{StreamConnector, StreamTransport, WsConnector};
