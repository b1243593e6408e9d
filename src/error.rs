//! Error taxonomy for the resilience layer.
//!
//! Transient transport trouble is retried internally and only reaches callers
//! once a retry budget is spent. Programming errors (empty endpoint lists,
//! facade used before init) are returned immediately and never retried.

use std::time::Duration;

use thiserror::Error;

/// JSON-RPC codes that no other endpoint can fix.
const CALLER_ERROR_CODES: &[i64] = &[-32700, -32600, -32601, -32602];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResilienceError {
    #[error("resilience context used before init")]
    NotInitialized,

    #[error("{channel} endpoint list is empty")]
    EmptyEndpointList { channel: &'static str },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no usable client for {endpoint} yet")]
    NotReady { endpoint: String },

    #[error("transport failure on {endpoint}: {cause}")]
    Transport { endpoint: String, cause: String },

    #[error("{endpoint} did not answer within {after:?}")]
    Timeout { endpoint: String, after: Duration },

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("channel stopped")]
    Stopped,
}

impl ResilienceError {
    pub fn transport(endpoint: impl Into<String>, cause: &anyhow::Error) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            cause: format!("{cause:#}"),
        }
    }

    /// Whether this failure should count against the endpoint and drive
    /// retry / rotation, as opposed to being handed straight back.
    pub fn is_endpoint_failure(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::UnexpectedReply(_) => true,
            Self::Rpc { code, .. } => !CALLER_ERROR_CODES.contains(code),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ResilienceError>;
