//! Subscription channel session
//!
//! One session owns one streaming connection to one endpoint. A spawned driver
//! task runs the state machine; the handle only sends commands and reads the
//! published state.
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected
//!       ^                         |                    |
//!       |                       close                close
//!       |                         v                    v
//!       +--- exhausted ---- Disconnected -> Reconnecting --delay--> Connecting
//! ```
//!
//! A close caused by `disconnect()` stays in `Disconnected`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::events::{ChannelEvent, ConnectionState, EventBus};
use crate::metrics::ChannelMetrics;
use crate::rotation::Endpoint;

use super::transport::{StreamConnector, StreamTransport};

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delay between reconnect attempts.
    pub backoff: BackoffPolicy,
    /// Reconnects allowed before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Upper bound on a single dial.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
            max_retries: Some(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// SESSION HANDLE
// =============================================================================

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Shutdown,
}

pub struct SubscriptionSession {
    endpoint: Endpoint,
    /// Written only by the driver.
    state: Arc<RwLock<ConnectionState>>,
    events: Arc<EventBus>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// Outbound payloads, accepted only while `Connected`.
    out_tx: mpsc::UnboundedSender<String>,
    /// Driver task, taken by `shutdown`.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionSession {
    /// Spawn the driver task. The session starts `Disconnected`; nothing is
    /// dialed until `connect()`.
    pub fn spawn(
        endpoint: Endpoint,
        connector: Arc<dyn StreamConnector>,
        config: SessionConfig,
        metrics: Arc<ChannelMetrics>,
    ) -> Self {
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let events = Arc::new(EventBus::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            endpoint: endpoint.clone(),
            connector,
            backoff: Backoff::new(config.backoff),
            config,
            state: Arc::clone(&state),
            events: Arc::clone(&events),
            metrics,
            cmd_rx,
            out_rx,
        };
        let task = tokio::spawn(driver.run());

        Self {
            endpoint,
            state,
            events,
            cmd_tx,
            out_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Start connecting. Clears any pending reconnect timer.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect);
    }

    /// Close and stay closed. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    /// Queue a payload on the live connection. Returns `false` unless the
    /// session is `Connected`.
    pub fn send(&self, payload: impl Into<String>) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        self.out_tx.send(payload.into()).is_ok()
    }

    /// Stop the driver and wait for it to release the connection.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// What the driver does next.
enum Step {
    Idle,
    Connect,
    Live(Box<dyn StreamTransport>),
    Wait(Duration),
    Stop,
}

struct Driver {
    endpoint: Endpoint,
    connector: Arc<dyn StreamConnector>,
    config: SessionConfig,
    /// Attempt counter; reset on open and on an explicit connect.
    backoff: Backoff,
    state: Arc<RwLock<ConnectionState>>,
    events: Arc<EventBus>,
    metrics: Arc<ChannelMetrics>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    out_rx: mpsc::UnboundedReceiver<String>,
}

impl Driver {
    async fn run(mut self) {
        let mut step = Step::Idle;
        loop {
            step = match step {
                Step::Idle => self.idle().await,
                Step::Connect => self.connect().await,
                Step::Live(transport) => self.live(transport).await,
                Step::Wait(delay) => self.wait(delay).await,
                Step::Stop => break,
            };
        }
        self.drain_outbound();
        self.transition(ConnectionState::Disconnected, "shutdown");
        debug!(endpoint = %self.endpoint, "session_driver_exit");
    }

    fn transition(&self, next: ConnectionState, reason: &str) {
        let prev = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, next)
        };
        if prev == next {
            return;
        }
        info!(
            endpoint = %self.endpoint,
            from = %prev,
            to = %next,
            reason,
            "session_transition"
        );
        self.events.emit(ChannelEvent::StateChange(next));
    }

    /// Payloads queued for a connection that is going away are dropped.
    fn drain_outbound(&mut self) {
        let mut dropped = 0usize;
        while self.out_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(endpoint = %self.endpoint, dropped, "outbound_discarded");
        }
    }

    async fn idle(&mut self) -> Step {
        match self.cmd_rx.recv().await {
            Some(Command::Connect) => {
                self.backoff.reset();
                Step::Connect
            }
            Some(Command::Disconnect) => Step::Idle,
            Some(Command::Shutdown) | None => Step::Stop,
        }
    }

    async fn connect(&mut self) -> Step {
        self.transition(ConnectionState::Connecting, "connect");
        self.metrics.record_connect_attempt();

        let connector = Arc::clone(&self.connector);
        let endpoint = self.endpoint.clone();
        let limit = self.config.connect_timeout;
        let attempt =
            async move { tokio::time::timeout(limit, connector.connect(&endpoint)).await };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(Ok(transport)) => self.opened(transport),
                        Ok(Err(e)) => self.closed(Some(format!("{e:#}")), false),
                        Err(_) => self.closed(
                            Some(format!("connect timed out after {}ms", limit.as_millis())),
                            false,
                        ),
                    };
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Connect) => continue,
                    Some(Command::Disconnect) => return self.closed(None, true),
                    Some(Command::Shutdown) | None => return Step::Stop,
                },
            }
        }
    }

    fn opened(&mut self, transport: Box<dyn StreamTransport>) -> Step {
        self.drain_outbound();
        self.backoff.reset();
        self.metrics.record_connect_success();
        self.transition(ConnectionState::Connected, "open");
        self.events.emit(ChannelEvent::Open {
            endpoint: self.endpoint.clone(),
        });
        Step::Live(transport)
    }

    async fn live(&mut self, mut transport: Box<dyn StreamTransport>) -> Step {
        loop {
            tokio::select! {
                inbound = transport.recv() => match inbound {
                    Some(Ok(data)) => {
                        self.metrics.record_message();
                        self.events.emit(ChannelEvent::Message(Arc::from(data)));
                    }
                    Some(Err(e)) => {
                        let cause = format!("{e:#}");
                        warn!(endpoint = %self.endpoint, error = %cause, "stream_error");
                        transport.close().await;
                        return self.closed(Some(cause), false);
                    }
                    None => {
                        debug!(endpoint = %self.endpoint, "stream_ended");
                        return self.closed(None, false);
                    }
                },
                Some(payload) = self.out_rx.recv() => {
                    if let Err(e) = transport.send(payload).await {
                        let cause = format!("{e:#}");
                        warn!(endpoint = %self.endpoint, error = %cause, "stream_send_failed");
                        transport.close().await;
                        return self.closed(Some(cause), false);
                    }
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Connect) => {}
                    Some(Command::Disconnect) => {
                        transport.close().await;
                        return self.closed(None, true);
                    }
                    Some(Command::Shutdown) | None => {
                        transport.close().await;
                        return Step::Stop;
                    }
                },
            }
        }
    }

    /// Close path shared by failed dials, dropped connections and
    /// caller-requested disconnects.
    fn closed(&mut self, cause: Option<String>, by_caller: bool) -> Step {
        self.drain_outbound();

        if let Some(cause) = cause {
            self.metrics.record_failure();
            self.events.emit(ChannelEvent::Error(cause));
        }

        if by_caller {
            self.transition(ConnectionState::Disconnected, "caller_disconnect");
            return Step::Idle;
        }

        self.transition(ConnectionState::Disconnected, "closed");
        self.transition(ConnectionState::Reconnecting, "closed");
        self.metrics.record_reconnect();

        if let Some(max) = self.config.max_retries {
            if self.backoff.attempt() >= max {
                warn!(
                    endpoint = %self.endpoint,
                    attempts = self.backoff.attempt(),
                    "max_retries_reached"
                );
                self.transition(ConnectionState::Disconnected, "max_retries");
                self.events.emit(ChannelEvent::MaxRetriesReached {
                    endpoint: self.endpoint.clone(),
                });
                return Step::Idle;
            }
        }

        let attempt = self.backoff.attempt() + 1;
        let delay = self.backoff.next_delay();
        info!(
            endpoint = %self.endpoint,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect_scheduled"
        );
        self.events
            .emit(ChannelEvent::ReconnectScheduled { attempt, delay });
        Step::Wait(delay)
    }

    async fn wait(&mut self, delay: Duration) -> Step {
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        tokio::select! {
            _ = &mut timer => Step::Connect,
            cmd = self.cmd_rx.recv() => match cmd {
                // Pending timer is dropped with this future.
                Some(Command::Connect) => Step::Connect,
                Some(Command::Disconnect) => {
                    self.transition(ConnectionState::Disconnected, "caller_disconnect");
                    Step::Idle
                }
                Some(Command::Shutdown) | None => Step::Stop,
            },
        }
    }
}
