//! RPC failover layer
//!
//! Keeps a usable connection to a cluster of JSON-RPC nodes across endpoint
//! outages, on two independent channels:
//!
//! - a request/response channel (`request::RequestPool`) that serves calls
//!   from whichever endpoint is healthy, retrying and rotating underneath;
//! - a subscription channel (`stream::SubscriptionManager`) that keeps one
//!   streaming connection alive, switches endpoints when the primary keeps
//!   failing, and replays the caller's subscriptions on every new connection.
//!
//! `facade::ResilienceContext` owns both and is the intended entry point.

pub mod backoff;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod facade;
pub mod metrics;
pub mod request;
pub mod rotation;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use backoff::{Backoff, BackoffPolicy};
pub use config::ResilienceConfig;
pub use envelope::{Commitment, InboundMessage, NodeVersion, RpcReply, RpcRequest};
pub use error::{ResilienceError, Result};
pub use events::{ChannelEvent, ConnectionState, EventBus};
pub use facade::{Connectors, ResilienceContext};
pub use rotation::{Endpoint, RotationTable};
