//! rpc-watch
//!
//! Keeps both channels up against the configured node cluster, logs every
//! channel event, and polls the current slot through the request pool.
//!
//! Usage:
//!   rpc-watch --config rpc.toml --mention <address> --slot-interval-secs 10
//!
//! Environment Variables (when no --config is given):
//!   RPC_ENDPOINTS / WS_ENDPOINTS - comma separated, primary first
//!   RPC_* tuning variables, see `ResilienceConfig::from_env`
//!   RUST_LOG - overrides --log-level

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rpc_failover::stream::IntentSet;
use rpc_failover::{
    ChannelEvent, Commitment, InboundMessage, ResilienceConfig, ResilienceContext, RpcReply,
    RpcRequest,
};

#[derive(Parser, Debug)]
#[command(name = "rpc-watch")]
#[command(about = "Watch a JSON-RPC node cluster through the failover layer")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "RPC_CONFIG_PATH")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Subscribe to logs mentioning this address (repeatable)
    #[arg(short, long)]
    mention: Vec<String>,

    /// Seconds between getSlot polls; 0 disables polling
    #[arg(long, default_value = "10")]
    slot_interval_secs: u64,
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("rpc_failover={level},rpc_watch={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level.to_lowercase());

    let config = match &args.config {
        Some(path) => {
            info!(path = %path, "loading config");
            ResilienceConfig::from_toml_file(path)?
        }
        None => {
            info!("using environment configuration");
            ResilienceConfig::from_env()
        }
    };

    info!(
        request = ?config.request_endpoints,
        stream = ?config.stream_endpoints,
        "rpc-watch starting"
    );

    let intent = Arc::new(IntentSet::with_requests(args.mention.iter().map(|address| {
        RpcRequest::LogsSubscribe {
            mentions: vec![address.clone()],
            commitment: Commitment::Confirmed,
        }
    })));

    let ctx = Arc::new(ResilienceContext::new());
    ctx.init(&config, intent)
        .await
        .context("Failed to initialize resilience context")?;

    let events = ctx.subscriptions()?.subscribe();
    let request_events = ctx.request_pool()?.subscribe();
    let stream_log = tokio::spawn(log_events("stream", events));
    let request_log = tokio::spawn(log_events("request", request_events));

    let poller = (args.slot_interval_secs > 0).then(|| {
        let ctx = Arc::clone(&ctx);
        let every = Duration::from_secs(args.slot_interval_secs);
        tokio::spawn(poll_slot(ctx, every))
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown requested");

    if let Some(poller) = poller {
        poller.abort();
    }
    ctx.stop().await;
    stream_log.abort();
    request_log.abort();

    info!("rpc-watch stopped");
    Ok(())
}

async fn log_events(channel: &'static str, mut rx: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = rx.recv().await {
        match &event {
            ChannelEvent::Open { endpoint } => info!(channel, endpoint = %endpoint, "open"),
            ChannelEvent::StateChange(state) => info!(channel, state = %state, "state_change"),
            ChannelEvent::Error(cause) => warn!(channel, error = %cause, "channel_error"),
            ChannelEvent::ReconnectScheduled { attempt, delay } => info!(
                channel,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnect_scheduled"
            ),
            ChannelEvent::MaxRetriesReached { endpoint } => {
                warn!(channel, endpoint = %endpoint, "max_retries_reached")
            }
            ChannelEvent::EndpointSwitched { from, to } => {
                warn!(channel, from = %from, to = %to, "endpoint_switched")
            }
            ChannelEvent::Message(_) => match event.decode() {
                Some(InboundMessage::Notification {
                    method,
                    subscription,
                    result,
                }) => info!(channel, method = %method, subscription, %result, "notification"),
                Some(InboundMessage::Reply { id, result }) => {
                    info!(channel, id, %result, "reply")
                }
                Some(InboundMessage::Failure { id, code, message }) => {
                    warn!(channel, ?id, code, error = %message, "rpc_failure")
                }
                Some(InboundMessage::Unrecognized(value)) => {
                    warn!(channel, %value, "unrecognized_message")
                }
                None => {}
            },
        }
    }
}

async fn poll_slot(ctx: Arc<ResilienceContext>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    let request = RpcRequest::GetSlot {
        commitment: Some(Commitment::Confirmed),
    };

    loop {
        ticker.tick().await;
        match ctx.call(&request).await {
            Ok(RpcReply::Slot(slot)) => {
                let endpoint = ctx
                    .current_request_endpoint()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                info!(slot, endpoint = %endpoint, "slot");
            }
            Ok(other) => warn!(reply = ?other, "unexpected getSlot reply"),
            Err(e) => error!(error = %e, "getSlot failed"),
        }
    }
}
