//! Lookout: follow many channels with a single live subscription.
//!
//! This is the simulation host. It initializes tracing, loads configuration
//! from a TOML file, serves the configured channels from an in-memory
//! transport with periodic synthetic traffic, opens the last used channel and
//! lets the scheduler poll the rest until Ctrl+C or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lookout::config::{AppConfig, ChannelConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use lookout::store::JsonFileStore;
use lookout::subscription::{
    activity_handler, now_millis, ChannelScheduler, Credentials, HistoryMessage, LiveHandlers,
    MemoryTransport,
};

/// Lookout: keep one channel live and poll the rest
#[derive(Parser, Debug)]
#[command(name = "lookout", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "lookout=trace")
    #[arg(short, long)]
    log_level: Option<String>,

    /// Channel to open first (defaults to the last opened channel)
    #[arg(short, long)]
    active: Option<String>,

    /// Switch the active channel to the next one every N seconds
    #[arg(short, long)]
    rotate_seconds: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!(path = %args.config, "Loaded configuration");

    if config.channels.is_empty() {
        return Err("No channels configured. Add [[channel]] sections".into());
    }

    let transport = Arc::new(MemoryTransport::new());
    for channel in &config.channels {
        transport.add_channel_with_stream(
            &channel.id,
            channel.stream_id(),
            channel.secret.clone().map(Credentials::with_secret),
        );
        tracing::info!(
            id = %channel.id,
            stream = %channel.stream_id(),
            interval_secs = channel.message_interval().as_secs(),
            has_secret = channel.secret.is_some(),
            "Channel configured"
        );
    }
    spawn_traffic(&transport, &config.channels);

    let store = Arc::new(JsonFileStore::open(&config.store.path)?);
    tracing::info!(path = %store.path().display(), "Opened state store");

    let scheduler = ChannelScheduler::new(
        transport.clone(),
        transport.clone(),
        store,
        config.scheduler.clone(),
    )?;

    scheduler
        .on_activity(activity_handler(|channel, activity| {
            tracing::info!(
                %channel,
                unread = activity.unread_count,
                last_message_time = activity.last_message_time,
                "New activity"
            );
            Ok(())
        }))
        .await;

    // Start first so every channel has a record before the first one is opened
    scheduler.start().await;

    let channel_ids: Vec<String> = config.channels.iter().map(|c| c.id.clone()).collect();
    let initial = args
        .active
        .clone()
        .or_else(|| scheduler.last_opened_channel())
        .filter(|id| channel_ids.contains(id))
        .unwrap_or_else(|| channel_ids[0].clone());
    open_channel(&scheduler, &initial).await;

    if let Some(secs) = args.rotate_seconds {
        spawn_rotation(scheduler.clone(), channel_ids, Duration::from_secs(secs.max(1)));
    }

    shutdown_signal().await;

    scheduler.cleanup().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Make a channel active and mark it read; failures are logged
async fn open_channel(scheduler: &ChannelScheduler, channel_id: &str) {
    let handlers = LiveHandlers::on_message(|channel, message| {
        tracing::info!(%channel, timestamp = message.timestamp, content = %message.content, "Live message");
    });

    match scheduler.set_active(channel_id, None, handlers).await {
        Ok(()) => {
            if let Err(e) = scheduler.clear_unread(channel_id).await {
                tracing::warn!(error = %e, "Failed to clear unread count");
            }
        }
        Err(e) => {
            tracing::error!(channel = %channel_id, error = %e, "Could not open channel");
        }
    }
}

/// Publish a synthetic message on every channel at its configured interval
fn spawn_traffic(transport: &Arc<MemoryTransport>, channels: &[ChannelConfig]) {
    for channel in channels {
        let transport = transport.clone();
        let id = channel.id.clone();
        let interval = channel.message_interval();
        tokio::spawn(async move {
            let mut sequence = 0u64;
            loop {
                tokio::time::sleep(interval).await;
                sequence += 1;
                transport.push_message(
                    &id,
                    HistoryMessage {
                        timestamp: now_millis(),
                        sender: Some("simulator".to_string()),
                        content: format!("message {} on {}", sequence, id),
                    },
                );
            }
        });
    }
}

/// Cycle the active channel through all channels
fn spawn_rotation(scheduler: ChannelScheduler, channel_ids: Vec<String>, every: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            let current = scheduler.active_id().await;
            let next_index = current
                .and_then(|id| channel_ids.iter().position(|c| *c == id))
                .map_or(0, |i| (i + 1) % channel_ids.len());
            tracing::info!(channel = %channel_ids[next_index], "Rotating active channel");
            open_channel(&scheduler, &channel_ids[next_index]).await;
        }
    });
}

/// Wait for SIGTERM or Ctrl+C
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
