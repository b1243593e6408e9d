//! Subscription channel manager
//!
//! Supervises one `SubscriptionSession` at a time against the rotation
//! table's current endpoint. Two things make it move to another endpoint:
//!
//! - the primary endpoint (rank 0) entering `Reconnecting` a threshold number
//!   of times with no successful open in between;
//! - the session exhausting its own retry budget, in which case the endpoint
//!   is also marked failed.
//!
//! Every session event is re-emitted on the manager's own bus, so observers
//! keep one subscription across endpoint switches. The caller's subscription
//! intent is replayed on every open.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::envelope::RpcRequest;
use crate::events::{ChannelEvent, ConnectionState, EventBus};
use crate::metrics::ChannelMetrics;
use crate::rotation::{Endpoint, RotationTable};

use super::intent::SubscriptionIntent;
use super::session::{SessionConfig, SubscriptionSession};
use super::transport::StreamConnector;

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Applied to every session the manager builds.
    pub session: SessionConfig,
    /// Consecutive primary reconnects before moving to a backup. 0 disables.
    pub primary_failure_threshold: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            primary_failure_threshold: 3,
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Why `watch_session` returned.
enum Verdict {
    Switch { mark_failed: bool, reason: &'static str },
    Stop,
}

pub struct SubscriptionManager {
    /// Streaming endpoints, primary first.
    table: Mutex<RotationTable>,
    connector: Arc<dyn StreamConnector>,
    config: ManagerConfig,
    /// Read on every open, never cached.
    intent: Arc<dyn SubscriptionIntent>,
    /// The live session, `None` between teardown and rebuild.
    session: RwLock<Option<Arc<SubscriptionSession>>>,
    /// Mirror of the live session's state.
    state: RwLock<ConnectionState>,
    events: EventBus,
    /// Shared with every session so counters survive switches.
    metrics: Arc<ChannelMetrics>,
    /// `Reconnecting` transitions on the primary since the last open.
    primary_failures: AtomicU32,
    /// JSON-RPC ids, unique across sessions.
    next_request_id: AtomicU64,
    stop_tx: watch::Sender<bool>,
    /// Supervisor task.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
    pub fn new(
        table: RotationTable,
        connector: Arc<dyn StreamConnector>,
        config: ManagerConfig,
        intent: Arc<dyn SubscriptionIntent>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            table: Mutex::new(table),
            connector,
            config,
            intent,
            session: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            events: EventBus::new(),
            metrics: Arc::new(ChannelMetrics::new()),
            primary_failures: AtomicU32::new(0),
            next_request_id: AtomicU64::new(1),
            stop_tx,
            task: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("subscription manager already running");
            return;
        }
        self.stop_tx.send_replace(false);
        let manager = Arc::clone(self);
        *task = Some(tokio::spawn(manager.supervise()));
        info!(
            endpoints = self.table.lock().len(),
            threshold = self.config.primary_failure_threshold,
            "subscription_manager_started"
        );
    }

    /// Tear down the active session. Safe to call more than once.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!(
                metrics = %self.metrics.summary(),
                "subscription_manager_stopped"
            );
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn current_endpoint(&self) -> Endpoint {
        self.table.lock().current().clone()
    }

    pub fn primary_failures(&self) -> u32 {
        self.primary_failures.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.metrics
    }

    /// Raw payload on the live session. `false` when nothing is connected.
    pub fn send(&self, payload: impl Into<String>) -> bool {
        match self.session.read().as_ref() {
            Some(session) => session.send(payload),
            None => false,
        }
    }

    /// Encode and send with a fresh request id. Returns the id if queued.
    pub fn send_request(&self, request: &RpcRequest) -> Option<u64> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.send(request.encode(id)).then_some(id)
    }

    /// Dial the current endpoint now, skipping any pending backoff delay.
    pub fn reconnect(&self) {
        if let Some(session) = self.session.read().as_ref() {
            session.connect();
        }
    }

    /// One session per loop iteration; each iteration ends in a switch or a stop.
    async fn supervise(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let endpoint = self.current_endpoint();
            let session = Arc::new(SubscriptionSession::spawn(
                endpoint.clone(),
                Arc::clone(&self.connector),
                self.config.session.clone(),
                Arc::clone(&self.metrics),
            ));
            let mut rx = session.subscribe();
            *self.session.write() = Some(Arc::clone(&session));
            session.connect();

            let verdict = tokio::select! {
                verdict = self.watch_session(&session, &mut rx) => verdict,
                _ = stop_rx.changed() => Verdict::Stop,
            };

            session.shutdown().await;
            *self.session.write() = None;

            match verdict {
                Verdict::Stop => break,
                Verdict::Switch {
                    mark_failed,
                    reason,
                } => self.rotate(&endpoint, mark_failed, reason),
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!("subscription_manager_exit");
    }

    async fn watch_session(
        &self,
        session: &SubscriptionSession,
        rx: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Verdict {
        while let Some(event) = rx.recv().await {
            if let ChannelEvent::StateChange(state) = &event {
                *self.state.write() = *state;
            }
            self.events.emit(event.clone());

            match event {
                ChannelEvent::Open { .. } => {
                    self.primary_failures.store(0, Ordering::Relaxed);
                    self.replay(session);
                }
                ChannelEvent::StateChange(ConnectionState::Reconnecting)
                    if session.endpoint().is_primary() =>
                {
                    let failures = self.primary_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    let threshold = self.config.primary_failure_threshold;
                    debug!(failures, threshold, "primary_reconnect");
                    // Fires once per run of failures; the counter only
                    // resets on a successful open.
                    if threshold > 0 && failures == threshold {
                        return Verdict::Switch {
                            mark_failed: false,
                            reason: "primary_failure_threshold",
                        };
                    }
                }
                ChannelEvent::MaxRetriesReached { .. } => {
                    return Verdict::Switch {
                        mark_failed: true,
                        reason: "max_retries_reached",
                    };
                }
                _ => {}
            }
        }
        Verdict::Stop
    }

    fn replay(&self, session: &SubscriptionSession) {
        let messages = self.intent.messages();
        let total = messages.len();
        let mut sent = 0usize;

        for request in &messages {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if !session.send(request.encode(id)) {
                warn!(
                    endpoint = %session.endpoint(),
                    method = request.method(),
                    "subscription_replay_interrupted"
                );
                break;
            }
            sent += 1;
        }

        info!(
            endpoint = %session.endpoint(),
            sent,
            total,
            "subscription_intent_replayed"
        );
    }

    fn rotate(&self, from: &Endpoint, mark_failed: bool, reason: &'static str) {
        let to = {
            let mut table = self.table.lock();
            if mark_failed {
                let index = table.current_index();
                table.mark_failed(index);
            }
            table.advance().clone()
        };

        self.metrics.record_endpoint_switch();
        warn!(from = %from, to = %to, reason, "stream_endpoint_switch");

        self.set_state(ConnectionState::Switching);
        self.events.emit(ChannelEvent::EndpointSwitched {
            from: from.clone(),
            to,
        });
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            self.events.emit(ChannelEvent::StateChange(next));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::envelope::InboundMessage;
    use crate::stream::intent::IntentSet;
    use crate::test_support::{wait_for, MockStreamConnector, Script};

    fn config(max_retries: Option<u32>, threshold: u32) -> ManagerConfig {
        ManagerConfig {
            session: SessionConfig {
                backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2))
                    .with_jitter(0.0),
                max_retries,
                connect_timeout: Duration::from_secs(1),
            },
            primary_failure_threshold: threshold,
        }
    }

    fn manager(
        connector: Arc<MockStreamConnector>,
        config: ManagerConfig,
        intent: Arc<dyn SubscriptionIntent>,
    ) -> Arc<SubscriptionManager> {
        let table = RotationTable::new("stream", ["wss://p1", "wss://p2"]).unwrap();
        SubscriptionManager::new(table, connector, config, intent)
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_threshold_switches_once() {
        let (connector, _links) = MockStreamConnector::new();
        let mgr = manager(Arc::clone(&connector), config(None, 3), Arc::new(Vec::<RpcRequest>::new()));
        let mut rx = mgr.subscribe();
        mgr.start();

        let mut reconnecting = 0;
        let switched = loop {
            match wait_for(&mut rx, |_| true).await {
                ChannelEvent::StateChange(ConnectionState::Reconnecting) => reconnecting += 1,
                event @ ChannelEvent::EndpointSwitched { .. } => break event,
                _ => {}
            }
        };
        assert_eq!(reconnecting, 3);
        match switched {
            ChannelEvent::EndpointSwitched { from, to } => {
                assert_eq!(from.uri(), "wss://p1");
                assert_eq!(to.uri(), "wss://p2");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mgr.current_endpoint().uri(), "wss://p2");
        assert_eq!(connector.attempts_for("wss://p1"), 3);

        // The backup keeps failing; no further switch without an open.
        tokio::time::sleep(Duration::from_secs(30)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, ChannelEvent::EndpointSwitched { .. }),
                "second switch: {event:?}"
            );
        }
        assert!(connector.attempts_for("wss://p2") > 1);
        assert_eq!(mgr.metrics().switches(), 1);

        mgr.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_resets_primary_counter() {
        let (connector, mut links) = MockStreamConnector::new();
        connector.script("wss://p1", [Script::Refuse, Script::Refuse, Script::Accept]);
        let mgr = manager(Arc::clone(&connector), config(None, 3), Arc::new(Vec::<RpcRequest>::new()));
        let mut rx = mgr.subscribe();
        mgr.start();

        wait_for(&mut rx, |e| matches!(e, ChannelEvent::Open { .. })).await;
        assert_eq!(mgr.primary_failures(), 0);
        assert_eq!(mgr.state(), ConnectionState::Connected);

        // Two more failures after the open are not enough to switch.
        let (_, link) = links.recv().await.unwrap();
        drop(link);
        wait_for(&mut rx, |e| matches!(e, ChannelEvent::ReconnectScheduled { attempt: 2, .. })).await;
        assert_eq!(mgr.primary_failures(), 2);
        assert_eq!(mgr.current_endpoint().uri(), "wss://p1");

        mgr.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_intent_replayed_in_order_on_every_open() {
        let (connector, mut links) = MockStreamConnector::new();
        connector.script("wss://p1", [Script::Accept, Script::Accept]);
        let intent = Arc::new(IntentSet::with_requests([
            RpcRequest::logs_mentioning("msg1"),
            RpcRequest::logs_mentioning("msg2"),
        ]));
        let mgr = manager(Arc::clone(&connector), config(None, 3), intent);
        mgr.start();

        for _ in 0..2 {
            let (uri, mut link) = links.recv().await.unwrap();
            assert_eq!(uri, "wss://p1");

            let mut mentions = Vec::new();
            for _ in 0..2 {
                let raw = link.outbound.recv().await.unwrap();
                let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
                assert_eq!(value["method"], "logsSubscribe");
                mentions.push(value["params"][0]["mentions"][0].as_str().unwrap().to_string());
            }
            assert_eq!(mentions, ["msg1", "msg2"]);
            drop(link);
        }

        mgr.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_intent_replayed_in_order_after_endpoint_switch() {
        let (connector, mut links) = MockStreamConnector::new();
        connector.script("wss://p2", [Script::Accept]);
        let intent = Arc::new(IntentSet::with_requests([
            RpcRequest::logs_mentioning("msg1"),
            RpcRequest::logs_mentioning("msg2"),
        ]));
        let mgr = manager(Arc::clone(&connector), config(None, 3), intent);
        let mut rx = mgr.subscribe();
        mgr.start();

        wait_for(&mut rx, |e| matches!(e, ChannelEvent::EndpointSwitched { .. })).await;
        let (uri, mut link) = links.recv().await.unwrap();
        assert_eq!(uri, "wss://p2");
        assert_eq!(
            connector.attempts(),
            ["wss://p1", "wss://p1", "wss://p1", "wss://p2"]
        );

        let mut sent = Vec::new();
        for _ in 0..2 {
            let raw = link.outbound.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(value["method"], "logsSubscribe");
            sent.push((
                value["id"].as_u64().unwrap(),
                value["params"][0]["mentions"][0].as_str().unwrap().to_string(),
            ));
        }
        assert_eq!(sent, [(1, "msg1".to_string()), (2, "msg2".to_string())]);

        mgr.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_rotates_and_forwards_messages() {
        let (connector, mut links) = MockStreamConnector::new();
        connector.script("wss://p2", [Script::Accept]);
        let mgr = manager(Arc::clone(&connector), config(Some(1), 0), Arc::new(Vec::<RpcRequest>::new()));
        let mut rx = mgr.subscribe();
        mgr.start();

        wait_for(&mut rx, |e| matches!(e, ChannelEvent::MaxRetriesReached { .. })).await;
        wait_for(&mut rx, |e| matches!(e, ChannelEvent::EndpointSwitched { .. })).await;
        let open = wait_for(&mut rx, |e| matches!(e, ChannelEvent::Open { .. })).await;
        assert!(matches!(open, ChannelEvent::Open { endpoint } if endpoint.uri() == "wss://p2"));

        let (_, link) = links.recv().await.unwrap();
        link.inbound
            .send(Ok(br#"{"jsonrpc":"2.0","method":"logsNotification","params":{"subscription":9,"result":{}}}"#.to_vec()))
            .unwrap();
        let msg = wait_for(&mut rx, |e| matches!(e, ChannelEvent::Message(_))).await;
        assert!(matches!(
            msg.decode(),
            Some(InboundMessage::Notification { subscription: 9, .. })
        ));

        assert_eq!(mgr.send_request(&RpcRequest::GetHealth), Some(1));

        mgr.stop().await;
        mgr.stop().await;
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(!mgr.send("after stop"));
    }
}
