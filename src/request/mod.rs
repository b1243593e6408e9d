//! Request/response channel

pub mod client;
pub mod pool;
pub mod transport;

pub use client::RpcClient;
pub use pool::{PoolConfig, RequestPool};
pub use transport::{HttpConnector, RpcConnector, RpcTransport};
