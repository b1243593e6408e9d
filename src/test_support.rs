//! Scripted connectors for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::events::ChannelEvent;
use crate::request::transport::{RpcConnector, RpcTransport};
use crate::rotation::Endpoint;
use crate::stream::transport::{StreamConnector, StreamTransport};

/// Receive until `pred` matches, failing the test if nothing shows up.
pub async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>, pred: F) -> ChannelEvent
where
    F: Fn(&ChannelEvent) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(3600), async {
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;

    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event stream closed"),
        Err(_) => panic!("timed out waiting for event"),
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Script {
    Refuse,
    Accept,
    /// Never completes; exercises the connect timeout.
    Hang,
}

/// Test side of an accepted mock connection. Dropping it closes the
/// connection from the peer's side.
pub struct MockLink {
    pub inbound: mpsc::UnboundedSender<std::result::Result<Vec<u8>, String>>,
    pub outbound: mpsc::UnboundedReceiver<String>,
}

pub struct MockStreamConnector {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    attempts: Mutex<Vec<String>>,
    links: mpsc::UnboundedSender<(String, MockLink)>,
}

impl MockStreamConnector {
    /// Unscripted attempts are refused.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, MockLink)>) {
        let (links, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            links,
        });
        (connector, rx)
    }

    pub fn script(&self, uri: &str, steps: impl IntoIterator<Item = Script>) {
        self.scripts
            .lock()
            .entry(uri.to_string())
            .or_default()
            .extend(steps);
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    pub fn attempts_for(&self, uri: &str) -> usize {
        self.attempts.lock().iter().filter(|u| *u == uri).count()
    }
}

#[async_trait]
impl StreamConnector for MockStreamConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn StreamTransport>> {
        let uri = endpoint.uri().to_string();
        self.attempts.lock().push(uri.clone());
        let step = self
            .scripts
            .lock()
            .get_mut(&uri)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Script::Refuse);

        match step {
            Script::Refuse => Err(anyhow!("connection refused: {uri}")),
            Script::Hang => std::future::pending().await,
            Script::Accept => {
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let _ = self.links.send((
                    uri,
                    MockLink {
                        inbound: inbound_tx,
                        outbound: outbound_rx,
                    },
                ));
                Ok(Box::new(MockTransport {
                    inbound: inbound_rx,
                    outbound: outbound_tx,
                }))
            }
        }
    }
}

struct MockTransport {
    inbound: mpsc::UnboundedReceiver<std::result::Result<Vec<u8>, String>>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl StreamTransport for MockTransport {
    async fn send(&mut self, payload: String) -> Result<()> {
        self.outbound
            .send(payload)
            .map_err(|_| anyhow!("peer went away"))
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        self.inbound.recv().await.map(|r| r.map_err(|e| anyhow!(e)))
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Request-side mock: every URI answers unless marked down.
#[derive(Default)]
pub struct MockRpcConnector {
    down: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockRpcConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, uri: &str, down: bool) {
        let mut set = self.down.lock();
        if down {
            set.insert(uri.to_string());
        } else {
            set.remove(uri);
        }
    }

    /// `(uri, method)` for every exchange, failed ones included.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, uri: &str, method: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(u, m)| u == uri && m == method)
            .count()
    }
}

impl RpcConnector for MockRpcConnector {
    fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn RpcTransport>> {
        Ok(Arc::new(MockRpcTransport {
            uri: endpoint.uri().to_string(),
            down: Arc::clone(&self.down),
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct MockRpcTransport {
    uri: String,
    down: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl RpcTransport for MockRpcTransport {
    async fn exchange(&self, request: Value) -> Result<Value> {
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let id = request["id"].clone();
        self.calls.lock().push((self.uri.clone(), method.clone()));

        if self.down.lock().contains(&self.uri) {
            return Err(anyhow!("connection refused: {}", self.uri));
        }

        let reply = match method.as_str() {
            "getVersion" => json!({"jsonrpc": "2.0", "id": id, "result": {"solana-core": "1.18.0", "feature-set": 123}}),
            "getHealth" => json!({"jsonrpc": "2.0", "id": id, "result": "ok"}),
            "getSlot" => json!({"jsonrpc": "2.0", "id": id, "result": 42}),
            _ => json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "Method not found"}}),
        };
        Ok(reply)
    }
}
