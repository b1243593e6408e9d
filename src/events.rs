//! Connection state and the events every channel emits.
//!
//! State is owned by the channel's own state machine and published as
//! `StateChange` events; nothing infers it by poking at a socket.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::envelope::InboundMessage;
use crate::rotation::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Waiting out a backoff delay (streaming channel only)
    Reconnecting,
    /// Moving to a different endpoint
    Switching,
    /// Idle until an explicit connect
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Switching => write!(f, "SWITCHING"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open { endpoint: Endpoint },
    /// Raw inbound payload, uninterpreted
    Message(Arc<[u8]>),
    Error(String),
    StateChange(ConnectionState),
    ReconnectScheduled { attempt: u32, delay: Duration },
    MaxRetriesReached { endpoint: Endpoint },
    EndpointSwitched { from: Endpoint, to: Endpoint },
}

impl ChannelEvent {
    /// Parse a `Message` payload as JSON-RPC. `None` for other events.
    pub fn decode(&self) -> Option<InboundMessage> {
        match self {
            Self::Message(raw) => Some(InboundMessage::parse(raw)),
            _ => None,
        }
    }
}

/// Explicit observer list. Each subscriber gets its own unbounded queue and
/// sees every event in emission order; dropped receivers are pruned lazily.
#[derive(Debug, Default)]
pub struct EventBus {
    observers: Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: ChannelEvent) {
        self.observers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}
