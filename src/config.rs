//! Resilience layer configuration
//!
//! Plain values only. Loaded from the environment (`RPC_*`, with `.env`
//! support) or from a TOML file; both paths go through `validate()` before
//! anything is constructed.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backoff::BackoffPolicy;
use crate::error::{ResilienceError, Result};
use crate::request::PoolConfig;
use crate::rotation::RotationTable;
use crate::stream::{ManagerConfig, SessionConfig};

pub const DEFAULT_REQUEST_ENDPOINT: &str = "https://api.mainnet-beta.solana.com";
pub const DEFAULT_STREAM_ENDPOINT: &str = "wss://api.mainnet-beta.solana.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Request endpoints, highest priority first
    pub request_endpoints: Vec<String>,
    /// Streaming endpoints, highest priority first
    pub stream_endpoints: Vec<String>,

    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_jitter: f64,

    /// Streaming reconnects per endpoint; `"unbounded"` in TOML for no limit
    #[serde(with = "retry_limit")]
    pub stream_max_retries: Option<u32>,
    pub request_max_retries: u32,
    pub request_retry_delay_ms: u64,
    pub health_check_interval_ms: u64,
    /// 0 disables proactive switching away from the primary
    pub primary_failure_threshold: u32,

    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            request_endpoints: vec![DEFAULT_REQUEST_ENDPOINT.to_string()],
            stream_endpoints: vec![DEFAULT_STREAM_ENDPOINT.to_string()],
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            backoff_jitter: 0.15,
            stream_max_retries: Some(10),
            request_max_retries: 3,
            request_retry_delay_ms: 1_000,
            health_check_interval_ms: 30_000,
            primary_failure_threshold: 3,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl ResilienceConfig {
    /// Defaults overridden by `RPC_*` / `WS_ENDPOINTS` environment variables.
    /// Unparsable values keep the default.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("RPC_ENDPOINTS") {
            self.request_endpoints = split_list(&v);
        }
        if let Some(v) = lookup("WS_ENDPOINTS") {
            self.stream_endpoints = split_list(&v);
        }

        override_parsed(&lookup, "RPC_BACKOFF_INITIAL_MS", &mut self.backoff_initial_ms);
        override_parsed(&lookup, "RPC_BACKOFF_MAX_MS", &mut self.backoff_max_ms);
        override_parsed(&lookup, "RPC_BACKOFF_MULTIPLIER", &mut self.backoff_multiplier);
        override_parsed(&lookup, "RPC_BACKOFF_JITTER", &mut self.backoff_jitter);
        override_parsed(&lookup, "RPC_REQUEST_MAX_RETRIES", &mut self.request_max_retries);
        override_parsed(&lookup, "RPC_REQUEST_RETRY_DELAY_MS", &mut self.request_retry_delay_ms);
        override_parsed(&lookup, "RPC_HEALTH_CHECK_INTERVAL_MS", &mut self.health_check_interval_ms);
        override_parsed(&lookup, "RPC_PRIMARY_FAILURE_THRESHOLD", &mut self.primary_failure_threshold);
        override_parsed(&lookup, "RPC_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms);
        override_parsed(&lookup, "RPC_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);

        if let Some(v) = lookup("RPC_STREAM_MAX_RETRIES") {
            match retry_limit::parse(&v) {
                Some(limit) => self.stream_max_retries = limit,
                None => warn!(value = %v, "ignoring unparsable RPC_STREAM_MAX_RETRIES"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(ResilienceError::EmptyEndpointList { channel: "request" });
        }
        if self.stream_endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(ResilienceError::EmptyEndpointList { channel: "stream" });
        }
        if self.backoff_initial_ms == 0 {
            return invalid("backoff_initial_ms must be positive");
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            return invalid("backoff_max_ms must be at least backoff_initial_ms");
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return invalid("backoff_multiplier must be a finite value >= 1.0");
        }
        if !(0.0..1.0).contains(&self.backoff_jitter) {
            return invalid("backoff_jitter must be in [0, 1)");
        }
        if self.health_check_interval_ms == 0 {
            return invalid("health_check_interval_ms must be positive");
        }
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return invalid("timeouts must be positive");
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
        .with_multiplier(self.backoff_multiplier)
        .with_jitter(self.backoff_jitter)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            backoff: self.backoff_policy(),
            max_retries: self.stream_max_retries,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            session: self.session_config(),
            primary_failure_threshold: self.primary_failure_threshold,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_retries: self.request_max_retries,
            retry_delay: Duration::from_millis(self.request_retry_delay_ms),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn request_table(&self) -> Result<RotationTable> {
        RotationTable::new("request", self.request_endpoints.iter().map(String::as_str))
    }

    pub fn stream_table(&self) -> Result<RotationTable> {
        RotationTable::new("stream", self.stream_endpoints.iter().map(String::as_str))
    }
}

fn invalid(reason: &str) -> Result<()> {
    Err(ResilienceError::InvalidConfig(reason.to_string()))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %raw, "ignoring unparsable override"),
        }
    }
}

/// `Option<u32>` where `None` is spelled `"unbounded"`.
mod retry_limit {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<Option<u32>> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("unbounded") {
            return Some(None);
        }
        raw.parse().ok().map(Some)
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Count(u32),
        Word(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(n) => s.serialize_u32(*n),
            None => s.serialize_str("unbounded"),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Count(n) => Ok(Some(n)),
            Raw::Word(w) => parse(&w).ok_or_else(|| {
                serde::de::Error::custom(format!("expected a count or \"unbounded\", got {w:?}"))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn overridden(vars: &[(&str, &str)]) -> ResilienceConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = ResilienceConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned());
        config
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ResilienceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.stream_max_retries, Some(10));
        assert_eq!(config.pool_config().max_retries, 3);
        assert_eq!(config.manager_config().primary_failure_threshold, 3);
    }

    #[test]
    fn test_env_overrides() {
        let config = overridden(&[
            ("RPC_ENDPOINTS", "https://a, https://b ,,"),
            ("WS_ENDPOINTS", "wss://p1,wss://p2"),
            ("RPC_BACKOFF_INITIAL_MS", "250"),
            ("RPC_REQUEST_MAX_RETRIES", "not-a-number"),
            ("RPC_STREAM_MAX_RETRIES", "unbounded"),
        ]);
        assert_eq!(config.request_endpoints, vec!["https://a", "https://b"]);
        assert_eq!(config.stream_table().unwrap().len(), 2);
        assert_eq!(config.backoff_initial_ms, 250);
        assert_eq!(config.request_max_retries, 3);
        assert_eq!(config.stream_max_retries, None);
        assert!(config.session_config().max_retries.is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = overridden(&[("WS_ENDPOINTS", " , ")]);
        assert_eq!(
            config.validate(),
            Err(ResilienceError::EmptyEndpointList { channel: "stream" })
        );

        let mut config = ResilienceConfig::default();
        config.backoff_jitter = 1.0;
        assert!(matches!(config.validate(), Err(ResilienceError::InvalidConfig(_))));

        let mut config = ResilienceConfig::default();
        config.backoff_max_ms = 10;
        assert!(matches!(config.validate(), Err(ResilienceError::InvalidConfig(_))));
    }

    #[test]
    fn test_toml_retry_limit_spellings() {
        let config: ResilienceConfig = toml::from_str(
            r#"
            stream_endpoints = ["wss://p1", "wss://p2"]
            stream_max_retries = "unbounded"
            "#,
        )
        .unwrap();
        assert_eq!(config.stream_max_retries, None);
        assert_eq!(config.request_endpoints, vec![DEFAULT_REQUEST_ENDPOINT]);

        let config: ResilienceConfig = toml::from_str("stream_max_retries = 4").unwrap();
        assert_eq!(config.stream_max_retries, Some(4));

        assert!(toml::from_str::<ResilienceConfig>("stream_max_retries = \"lots\"").is_err());
    }
}
