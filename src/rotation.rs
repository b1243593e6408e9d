//! Endpoint rotation table
//!
//! Ordered candidate list (list order = configured priority) plus a set of
//! indices currently marked failed. `advance()` walks forward circularly,
//! skipping failed indices; when nothing is left it clears the failed set so
//! every endpoint gets a fresh chance.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, warn};

use crate::error::{ResilienceError, Result};

/// One addressable node URI and its configured rank (0 = primary).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    uri: String,
    rank: usize,
}

impl Endpoint {
    pub fn new(uri: impl Into<String>, rank: usize) -> Self {
        Self {
            uri: uri.into(),
            rank,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

#[derive(Debug, Clone)]
pub struct RotationTable {
    endpoints: Vec<Endpoint>,
    current: usize,
    failed: BTreeSet<usize>,
}

impl RotationTable {
    /// Build a table from URIs in priority order. `channel` only labels the
    /// error for an empty list.
    pub fn new<I, S>(channel: &'static str, uris: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints: Vec<Endpoint> = uris
            .into_iter()
            .map(Into::into)
            .map(|uri: String| uri.trim().to_string())
            .filter(|uri| !uri.is_empty())
            .enumerate()
            .map(|(rank, uri)| Endpoint::new(uri, rank))
            .collect();

        if endpoints.is_empty() {
            return Err(ResilienceError::EmptyEndpointList { channel });
        }

        Ok(Self {
            endpoints,
            current: 0,
            failed: BTreeSet::new(),
        })
    }

    pub fn current(&self) -> &Endpoint {
        &self.endpoints[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn is_failed(&self, index: usize) -> bool {
        self.failed.contains(&index)
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Out-of-range indices are ignored.
    pub fn mark_failed(&mut self, index: usize) {
        if index < self.endpoints.len() && self.failed.insert(index) {
            debug!(
                endpoint = %self.endpoints[index],
                failed = self.failed.len(),
                "endpoint_marked_failed"
            );
        }
    }

    /// Move to the next endpoint that is not marked failed.
    pub fn advance(&mut self) -> &Endpoint {
        let len = self.endpoints.len();

        if self.failed.len() >= len {
            self.clear_failed();
        }

        let candidate = (1..len)
            .map(|step| (self.current + step) % len)
            .find(|idx| !self.failed.contains(idx));

        self.current = match candidate {
            Some(idx) => idx,
            None => {
                // Every other endpoint is failed (or there is only one).
                self.clear_failed();
                (self.current + 1) % len
            }
        };

        &self.endpoints[self.current]
    }

    fn clear_failed(&mut self) {
        if !self.failed.is_empty() {
            warn!(
                endpoints = self.endpoints.len(),
                failed = self.failed.len(),
                "all_endpoints_failed, clearing failed set"
            );
        }
        self.failed.clear();
    }
}
