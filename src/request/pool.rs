//! Request channel pool
//!
//! Holds at most one published `RpcClient`, bound to the rotation table's
//! current endpoint. A client is published only after it has answered a
//! version query, so readers never see a half-built one.
//!
//! Failure handling is the same for requests, liveness probes and failed
//! connects: count the failure against the current endpoint, retry it after a
//! fixed delay, and once the count exceeds `max_retries` mark it failed and
//! move to the next endpoint.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::envelope::{NodeVersion, RpcReply, RpcRequest};
use crate::error::{ResilienceError, Result};
use crate::events::{ChannelEvent, ConnectionState, EventBus};
use crate::metrics::ChannelMetrics;
use crate::rotation::{Endpoint, RotationTable};

use super::client::RpcClient;
use super::transport::RpcConnector;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Failures tolerated on one endpoint before rotating.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub health_check_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// A failed attempt. `retry_after` is `None` when retrying cannot help.
struct Failure {
    error: ResilienceError,
    retry_after: Option<Duration>,
}

impl Failure {
    fn fatal(error: ResilienceError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

pub struct RequestPool {
    table: Mutex<RotationTable>,
    connector: Arc<dyn RpcConnector>,
    config: PoolConfig,
    client: ArcSwapOption<RpcClient>,
    /// Serializes connect attempts and client retirement.
    connect_lock: tokio::sync::Mutex<()>,
    retire_lock: Mutex<()>,
    retries: AtomicU32,
    recovering: AtomicBool,
    stopped: AtomicBool,
    last_used: Mutex<Option<Instant>>,
    state: RwLock<ConnectionState>,
    events: EventBus,
    metrics: ChannelMetrics,
    probe_task: Mutex<Option<JoinHandle<()>>>,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
}

impl RequestPool {
    pub fn new(
        table: RotationTable,
        connector: Arc<dyn RpcConnector>,
        config: PoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(table),
            connector,
            config,
            client: ArcSwapOption::empty(),
            connect_lock: tokio::sync::Mutex::new(()),
            retire_lock: Mutex::new(()),
            retries: AtomicU32::new(0),
            recovering: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            last_used: Mutex::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            events: EventBus::new(),
            metrics: ChannelMetrics::new(),
            probe_task: Mutex::new(None),
            recovery_task: Mutex::new(None),
        })
    }

    /// Kick off the first connect and the liveness probe loop.
    pub fn start(self: &Arc<Self>) {
        let mut probe = self.probe_task.lock();
        if probe.is_some() {
            warn!("request pool already running");
            return;
        }
        *probe = Some(self.spawn_probe_loop());
        drop(probe);

        self.ensure_recovering(Duration::ZERO);
        info!(
            endpoint = %self.current_endpoint(),
            interval_ms = self.config.health_check_interval.as_millis() as u64,
            "request_pool_started"
        );
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.probe_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.recovery_task.lock().take() {
            handle.abort();
        }
        self.client.store(None);
        self.set_state(ConnectionState::Disconnected);
        info!(metrics = %self.metrics.summary(), "request_pool_stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn current_endpoint(&self) -> Endpoint {
        self.table.lock().current().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.metrics
    }

    /// Failures counted against the current endpoint so far.
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    /// The published client, or `NotReady` (with a connect started in the
    /// background) if there is none yet.
    pub fn get_client(self: &Arc<Self>) -> Result<Arc<RpcClient>> {
        if self.is_stopped() {
            return Err(ResilienceError::Stopped);
        }
        self.touch();
        if let Some(client) = self.client.load_full() {
            return Ok(client);
        }
        self.ensure_recovering(Duration::ZERO);
        Err(ResilienceError::NotReady {
            endpoint: self.current_endpoint().to_string(),
        })
    }

    /// Serve `request` from whichever endpoint is healthy, retrying and
    /// rotating as needed. Caller errors are returned without retry.
    pub async fn call(self: &Arc<Self>, request: &RpcRequest) -> Result<RpcReply> {
        let endpoints = self.table.lock().len() as u32;
        let budget = self
            .config
            .max_retries
            .saturating_add(1)
            .saturating_mul(endpoints.max(1));
        let mut last = String::new();

        for attempt in 1..=budget {
            if self.is_stopped() {
                return Err(ResilienceError::Stopped);
            }
            self.touch();

            match self.attempt(request).await {
                Ok(reply) => return Ok(reply),
                Err(Failure {
                    error,
                    retry_after: None,
                }) => return Err(error),
                Err(Failure {
                    error,
                    retry_after: Some(delay),
                }) => {
                    debug!(attempt, budget, error = %error, "request_attempt_failed");
                    last = error.to_string();
                    if attempt < budget && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.ensure_recovering(self.config.retry_delay);
        Err(ResilienceError::Exhausted {
            attempts: budget,
            last,
        })
    }

    /// Feed a failure seen by a caller holding `client` into the pool.
    pub fn report_failure(self: &Arc<Self>, client: &Arc<RpcClient>, cause: &ResilienceError) {
        if !cause.is_endpoint_failure() {
            return;
        }
        let delay = self.register_failure(client.endpoint(), Some(client), cause);
        self.ensure_recovering(delay);
    }

    /// One liveness check against the published client.
    pub async fn probe(self: &Arc<Self>) -> Result<NodeVersion> {
        let Some(client) = self.client.load_full() else {
            self.ensure_recovering(Duration::ZERO);
            return Err(ResilienceError::NotReady {
                endpoint: self.current_endpoint().to_string(),
            });
        };

        match self.bounded(client.endpoint(), client.version()).await {
            Ok(version) => {
                self.retries.store(0, Ordering::Relaxed);
                debug!(endpoint = %client.endpoint(), core = %version.core, "probe_ok");
                Ok(version)
            }
            Err(error) => {
                self.metrics.record_probe_failure();
                warn!(endpoint = %client.endpoint(), error = %error, "probe_failed");
                let delay = self.register_failure(client.endpoint(), Some(&client), &error);
                self.ensure_recovering(delay);
                Err(error)
            }
        }
    }

    fn touch(&self) {
        *self.last_used.lock() = Some(Instant::now());
    }

    fn recently_used(&self) -> bool {
        let window = self.config.health_check_interval * 2;
        self.last_used
            .lock()
            .map_or(false, |at| at.elapsed() <= window)
    }

    async fn bounded<T>(
        &self,
        endpoint: &Endpoint,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let after = self.config.request_timeout;
        tokio::time::timeout(after, fut)
            .await
            .unwrap_or_else(|_| {
                Err(ResilienceError::Timeout {
                    endpoint: endpoint.to_string(),
                    after,
                })
            })
    }

    async fn attempt(&self, request: &RpcRequest) -> std::result::Result<RpcReply, Failure> {
        let client = self.acquire().await?;
        match self.bounded(client.endpoint(), client.call(request)).await {
            Ok(reply) => {
                self.retries.store(0, Ordering::Relaxed);
                Ok(reply)
            }
            Err(error) if !error.is_endpoint_failure() => Err(Failure::fatal(error)),
            Err(error) => {
                let delay = self.register_failure(client.endpoint(), Some(&client), &error);
                Err(Failure {
                    error,
                    retry_after: Some(delay),
                })
            }
        }
    }

    async fn acquire(&self) -> std::result::Result<Arc<RpcClient>, Failure> {
        match self.client.load_full() {
            Some(client) => Ok(client),
            None => self.connect().await,
        }
    }

    async fn connect(&self) -> std::result::Result<Arc<RpcClient>, Failure> {
        let _guard = self.connect_lock.lock().await;

        if self.is_stopped() {
            return Err(Failure::fatal(ResilienceError::Stopped));
        }
        if let Some(client) = self.client.load_full() {
            return Ok(client);
        }

        let endpoint = self.current_endpoint();
        self.set_state(ConnectionState::Connecting);
        self.metrics.record_connect_attempt();

        let opened = match self.connector.open(&endpoint) {
            Ok(transport) => {
                let client = Arc::new(RpcClient::new(endpoint.clone(), transport));
                self.bounded(&endpoint, client.version())
                    .await
                    .map(|version| (client, version))
            }
            Err(e) => Err(ResilienceError::transport(endpoint.uri(), &e)),
        };

        match opened {
            Ok((client, version)) => {
                self.client.store(Some(Arc::clone(&client)));
                self.metrics.record_connect_success();
                self.set_state(ConnectionState::Connected);
                self.events.emit(ChannelEvent::Open {
                    endpoint: endpoint.clone(),
                });
                info!(endpoint = %endpoint, core = %version.core, "request_client_ready");
                Ok(client)
            }
            Err(error) => {
                let delay = self.register_failure(&endpoint, None, &error);
                Err(Failure {
                    error,
                    retry_after: Some(delay),
                })
            }
        }
    }

    /// Count one failure against `endpoint` and rotate if its budget is
    /// spent. Returns how long to wait before the next attempt.
    fn register_failure(
        &self,
        endpoint: &Endpoint,
        failed: Option<&Arc<RpcClient>>,
        cause: &ResilienceError,
    ) -> Duration {
        if self.is_stopped() {
            return self.config.retry_delay;
        }

        // A client fails once, however many callers noticed.
        if let Some(failed) = failed {
            let _retire = self.retire_lock.lock();
            match self.client.load_full() {
                Some(current) if Arc::ptr_eq(&current, failed) => self.client.store(None),
                _ => return Duration::ZERO,
            }
        }

        let mut table = self.table.lock();
        if table.current() != endpoint {
            // Already rotated away from it.
            return Duration::ZERO;
        }

        let retries = self.retries.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.record_failure();
        self.events.emit(ChannelEvent::Error(cause.to_string()));

        if retries <= self.config.max_retries {
            drop(table);
            warn!(
                endpoint = %endpoint,
                attempt = retries,
                max = self.config.max_retries,
                delay_ms = self.config.retry_delay.as_millis() as u64,
                error = %cause,
                "request_endpoint_retry"
            );
            self.set_state(ConnectionState::Disconnected);
            return self.config.retry_delay;
        }

        let index = table.current_index();
        table.mark_failed(index);
        let to = table.advance().clone();
        drop(table);

        self.retries.store(0, Ordering::Relaxed);
        self.metrics.record_endpoint_switch();
        warn!(from = %endpoint, to = %to, failures = retries, "request_endpoint_switch");
        self.set_state(ConnectionState::Switching);

        let same = &to == endpoint;
        self.events.emit(ChannelEvent::EndpointSwitched {
            from: endpoint.clone(),
            to,
        });

        if same {
            self.config.retry_delay
        } else {
            Duration::ZERO
        }
    }

    /// Reconnect in the background unless a recovery loop is already running.
    fn ensure_recovering(self: &Arc<Self>, delay: Duration) {
        if self.is_stopped() || self.recovering.swap(true, Ordering::SeqCst) {
            return;
        }

        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut delay = delay;
            loop {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match pool.acquire().await {
                    Ok(_) => break,
                    Err(Failure {
                        retry_after: Some(next),
                        ..
                    }) => delay = next,
                    Err(_) => break,
                }
            }
            pool.recovery_finished();
        });
        *self.recovery_task.lock() = Some(handle);
    }

    /// Clear the recovery flag, then re-arm if the client was retired while
    /// the flag was still set: that failure's `ensure_recovering` was a no-op.
    fn recovery_finished(self: &Arc<Self>) {
        self.recovering.store(false, Ordering::SeqCst);
        if self.client.load().is_none() && !self.is_stopped() {
            debug!(endpoint = %self.current_endpoint(), "recovery_rearmed");
            self.ensure_recovering(self.config.retry_delay);
        }
    }

    fn spawn_probe_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                if pool.is_stopped() {
                    break;
                }
                if pool.recently_used() {
                    let _ = pool.probe().await;
                } else {
                    debug!(endpoint = %pool.current_endpoint(), "probe_skipped_idle");
                }
            }
        })
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            debug!(from = %prev, to = %next, "request_pool_transition");
            self.events.emit(ChannelEvent::StateChange(next));
        }
    }
}
