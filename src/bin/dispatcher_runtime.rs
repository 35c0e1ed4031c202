//! Dispatcher Runtime
//!
//! Wires the series dispatcher end to end:
//! - Tails a JSONL record feed into the ingress channel
//! - Groups records into series and waits for them to go idle
//! - Submits each completed series summary to the configured sink
//!
//! Usage:
//!   cargo run --release --bin dispatcher_runtime
//!
//! Environment variables (see `DispatcherConfig::from_env` for the full list):
//!   RECORD_FEED_PATH - JSONL file with one record per line (default: records.jsonl)
//!   SINK_TYPE - http or sqlite (default: http)
//!   SINK_URL - HTTP sink endpoint (default: http://localhost:5000)
//!   DISPATCH_MAX_WAIT_MS - idle time before a series is complete (default: 1000)
//!   DISPATCH_MODE - per_series or single_series (default: per_series)

use dotenv::dotenv;
use log::{error, info};
use seriesflow::ingress::{run_feed, FeedStart, JsonlFeed};
use seriesflow::pipeline::{
    run_dispatcher, ChannelSource, CompletionPublisher, DispatchEngine, DispatcherConfig,
    HttpSink, Record, SeriesSink, SinkType, SqliteSink,
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 Series Dispatcher Runtime");

    let config = DispatcherConfig::from_env()?;

    info!("📊 Configuration:");
    info!("   ├─ Record feed: {}", config.record_feed_path);
    info!("   ├─ Channel buffer: {} records", config.channel_buffer);
    info!("   ├─ Sink: {:?}", config.sink_type);
    info!("   └─ Sink timeout: {}ms", config.sink_timeout.as_millis());

    let sink: Arc<dyn SeriesSink> = match config.sink_type {
        SinkType::Http => {
            info!("🌐 Posting series summaries to {}", config.sink_url);
            Arc::new(HttpSink::new(config.sink_url.clone(), config.sink_timeout)?)
        }
        SinkType::Sqlite => Arc::new(SqliteSink::open(&config.sink_db_path)?),
    };
    let publisher = Arc::new(CompletionPublisher::new(sink, config.sink_timeout));

    let (tx, rx) = mpsc::channel::<Record>(config.channel_buffer);
    let engine = DispatchEngine::new(ChannelSource::new(rx), config.mode, config.max_wait)
        .with_retry_policy(config.retry_policy());
    let engine = Arc::new(Mutex::new(engine));

    let cancel = CancellationToken::new();

    // Task 1: record feed -> ingress channel
    let feed = JsonlFeed::new(&config.record_feed_path, FeedStart::Beginning);
    let feed_handle = tokio::spawn(run_feed(feed, tx, cancel.clone()));
    info!("   ├─ ✅ Record feed spawned");

    // Task 2: dispatcher loop
    let dispatcher_handle = tokio::spawn(run_dispatcher(
        engine.clone(),
        publisher,
        config.scheduler_settings(),
        cancel.clone(),
    ));
    info!("   └─ ✅ Dispatcher spawned");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    cancel.cancel();

    let feed_stats = feed_handle.await?;
    info!(
        "📖 Feed: {} forwarded, {} rejected",
        feed_stats.forwarded, feed_stats.rejected
    );

    let stats = dispatcher_handle.await?;
    info!(
        "📊 Series opened: {}, published: {}, failed attempts: {}",
        stats.opened, stats.published, stats.failed_publishes
    );

    info!("✅ Dispatcher runtime stopped");
    Ok(())
}
