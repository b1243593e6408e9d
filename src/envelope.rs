//! JSON-RPC 2.0 envelopes
//!
//! Outbound requests and inbound frames are tagged unions of the kinds this
//! layer knows about, with a fallback variant for everything else. Payloads
//! of subscription notifications are carried as raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ResilienceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcRequest {
    GetVersion,
    GetHealth,
    GetSlot { commitment: Option<Commitment> },
    LogsSubscribe {
        mentions: Vec<String>,
        commitment: Commitment,
    },
    LogsUnsubscribe { subscription: u64 },
    Custom { method: String, params: Value },
}

impl RpcRequest {
    pub fn logs_mentioning(address: impl Into<String>) -> Self {
        Self::LogsSubscribe {
            mentions: vec![address.into()],
            commitment: Commitment::default(),
        }
    }

    pub fn method(&self) -> &str {
        match self {
            Self::GetVersion => "getVersion",
            Self::GetHealth => "getHealth",
            Self::GetSlot { .. } => "getSlot",
            Self::LogsSubscribe { .. } => "logsSubscribe",
            Self::LogsUnsubscribe { .. } => "logsUnsubscribe",
            Self::Custom { method, .. } => method.as_str(),
        }
    }

    pub fn params(&self) -> Value {
        match self {
            Self::GetVersion | Self::GetHealth => json!([]),
            Self::GetSlot { commitment: None } => json!([]),
            Self::GetSlot {
                commitment: Some(c),
            } => json!([{ "commitment": c }]),
            Self::LogsSubscribe {
                mentions,
                commitment,
            } => json!([{ "mentions": mentions }, { "commitment": commitment }]),
            Self::LogsUnsubscribe { subscription } => json!([subscription]),
            Self::Custom { params, .. } => params.clone(),
        }
    }

    pub fn to_envelope(&self, id: u64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": self.method(),
            "params": self.params(),
        })
    }

    pub fn encode(&self, id: u64) -> String {
        self.to_envelope(id).to_string()
    }

    /// Interpret a successful `result` according to the request kind.
    pub fn decode_result(&self, result: Value) -> Result<RpcReply> {
        let reply = match self {
            Self::GetVersion => RpcReply::Version(parse(result)?),
            Self::GetHealth => RpcReply::Health(parse(result)?),
            Self::GetSlot { .. } => RpcReply::Slot(parse(result)?),
            Self::LogsSubscribe { .. } => RpcReply::Subscribed(parse(result)?),
            Self::LogsUnsubscribe { .. } => RpcReply::Unsubscribed(parse(result)?),
            Self::Custom { .. } => RpcReply::Other(result),
        };
        Ok(reply)
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    let shown = value.to_string();
    serde_json::from_value(value)
        .map_err(|e| ResilienceError::UnexpectedReply(format!("{e}: {shown}")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVersion {
    #[serde(rename = "solana-core")]
    pub core: String,
    #[serde(rename = "feature-set", default)]
    pub feature_set: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcReply {
    Version(NodeVersion),
    Health(String),
    Slot(u64),
    Subscribed(u64),
    Unsubscribed(bool),
    Other(Value),
}

/// Anything that can arrive on either channel.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Reply {
        id: u64,
        result: Value,
    },
    Failure {
        id: Option<u64>,
        code: i64,
        message: String,
    },
    Notification {
        method: String,
        subscription: u64,
        result: Value,
    },
    Unrecognized(Value),
}

#[derive(Deserialize)]
struct RawError {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct RawParams {
    subscription: u64,
    #[serde(default)]
    result: Value,
}

impl InboundMessage {
    pub fn parse(raw: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(raw) {
            Ok(value) => Self::from_value(value),
            Err(_) => Self::Unrecognized(Value::String(String::from_utf8_lossy(raw).into_owned())),
        }
    }

    pub fn from_value(value: Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::Unrecognized(value);
        };

        let id = obj.get("id").and_then(Value::as_u64);

        if let Some(err) = obj.get("error") {
            if let Ok(err) = serde_json::from_value::<RawError>(err.clone()) {
                return Self::Failure {
                    id,
                    code: err.code,
                    message: err.message,
                };
            }
        }

        if let (Some(id), Some(result)) = (id, obj.get("result")) {
            return Self::Reply {
                id,
                result: result.clone(),
            };
        }

        if let (Some(method), Some(params)) = (
            obj.get("method").and_then(Value::as_str),
            obj.get("params"),
        ) {
            if let Ok(p) = serde_json::from_value::<RawParams>(params.clone()) {
                return Self::Notification {
                    method: method.to_string(),
                    subscription: p.subscription,
                    result: p.result,
                };
            }
        }

        Self::Unrecognized(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_subscribe_envelope() {
        let req = RpcRequest::logs_mentioning("6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P");
        let env = req.to_envelope(7);
        assert_eq!(env["jsonrpc"], "2.0");
        assert_eq!(env["id"], 7);
        assert_eq!(env["method"], "logsSubscribe");
        assert_eq!(
            env["params"][0]["mentions"][0],
            "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P"
        );
        assert_eq!(env["params"][1]["commitment"], "confirmed");
    }

    #[test]
    fn test_parse_inbound_kinds() {
        let reply = InboundMessage::parse(br#"{"jsonrpc":"2.0","id":3,"result":24040}"#);
        assert_eq!(
            reply,
            InboundMessage::Reply {
                id: 3,
                result: json!(24040)
            }
        );

        let failure = InboundMessage::parse(
            br#"{"jsonrpc":"2.0","id":4,"error":{"code":-32005,"message":"Too many requests"}}"#,
        );
        assert!(matches!(
            failure,
            InboundMessage::Failure { id: Some(4), code: -32005, .. }
        ));

        let note = InboundMessage::parse(
            br#"{"jsonrpc":"2.0","method":"logsNotification","params":{"subscription":24040,"result":{"value":{"signature":"abc"}}}}"#,
        );
        match note {
            InboundMessage::Notification {
                method,
                subscription,
                result,
            } => {
                assert_eq!(method, "logsNotification");
                assert_eq!(subscription, 24040);
                assert_eq!(result["value"]["signature"], "abc");
            }
            other => panic!("expected notification, got {other:?}"),
        }

        assert!(matches!(
            InboundMessage::parse(b"not json"),
            InboundMessage::Unrecognized(Value::String(_))
        ));
        assert!(matches!(
            InboundMessage::parse(br#"{"hello":"world"}"#),
            InboundMessage::Unrecognized(_)
        ));
    }

    #[test]
    fn test_decode_result_by_kind() {
        let version = RpcRequest::GetVersion
            .decode_result(json!({"solana-core": "1.18.22", "feature-set": 3241752014u64}))
            .unwrap();
        assert_eq!(
            version,
            RpcReply::Version(NodeVersion {
                core: "1.18.22".into(),
                feature_set: Some(3241752014),
            })
        );

        let err = RpcRequest::GetSlot { commitment: None }
            .decode_result(json!("nope"))
            .unwrap_err();
        assert!(matches!(err, ResilienceError::UnexpectedReply(_)));

        let other = RpcRequest::Custom {
            method: "getBalance".into(),
            params: json!(["x"]),
        }
        .decode_result(json!({"value": 5}))
        .unwrap();
        assert_eq!(other, RpcReply::Other(json!({"value": 5})));
    }
}
