use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use auction_archive::app_context::AppContext;
use auction_archive::config::Config;
use auction_archive::ingest::{BusConsumer, HistoricalMigrator, LiveConsumer, WorkQueue};
use auction_archive::metrics_const::STORE_SIZE_BYTES;
use auction_archive::router::{router, serve};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(context: Arc<AppContext>) -> JoinHandle<()> {
    let bind = context.config.bind_address();
    let app = router(context);
    tokio::task::spawn(async move {
        serve(app, &bind)
            .await
            .expect("failed to start serving the API");
    })
}

/// Backfills the legacy database first, then follows the bus. The work
/// queues keep draining the whole time.
async fn run_ingest(context: Arc<AppContext>) -> Result<()> {
    let auction_queue = WorkQueue::new("auctions");
    let bid_queue = WorkQueue::new("bids");
    let workers = context.config.ingest_workers;
    let _auction_workers = auction_queue.spawn_workers(workers);
    let _bid_workers = bid_queue.spawn_workers(workers.div_ceil(2));

    if let Some(pool) = context.sql.clone() {
        let migrator = HistoricalMigrator::new(
            pool,
            context.hot.clone(),
            auction_queue.clone(),
            bid_queue.clone(),
            context.import_offset.clone(),
            context.cache.clone(),
        );
        migrator.run().await.context("historical backfill failed")?;
        context
            .import_offset
            .flush()
            .await
            .map_err(|e| anyhow::anyhow!("flushing import offset: {e}"))?;
    } else {
        info!("no legacy database configured, skipping backfill");
    }

    let consumer = BusConsumer::new(&context.config).context("creating bus consumer")?;
    let live = LiveConsumer::new(consumer, context.hot.clone(), &context.config);
    live.run().await
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("starting auction archive service");

    let config = Config::init_with_defaults().context(
        "failed to load configuration from environment variables, check your environment setup",
    )?;
    config.validate()?;
    info!("configuration loaded: {:?}", config);

    let context = Arc::new(AppContext::new(config).await?);

    let server_handle = start_server(context.clone());
    info!("serving on {}", context.config.bind_address());

    let mut handles: Vec<JoinHandle<()>> = vec![server_handle];

    if let Some(migrator) = context.migrator.clone() {
        let interval = context.config.migration_interval();
        handles.push(tokio::spawn(async move {
            migrator.run_loop(interval).await;
        }));
    }

    let ingest_context = context.clone();
    handles.push(tokio::spawn(async move {
        if let Err(err) = run_ingest(ingest_context).await {
            warn!("ingest pipeline exited: {err:#}");
        }
    }));

    // periodic store size gauge
    let metrics_context = context.clone();
    handles.push(tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            match metrics_context.hot.size_bytes() {
                Ok(size) => metrics::gauge!(STORE_SIZE_BYTES).set(size as f64),
                Err(err) => warn!("failed to read store size: {err}"),
            }
        }
    }));

    // if any service returns, take the rest down and exit
    let (result, _, others) = futures::future::select_all(handles).await;
    warn!("a service loop finished, shutting down: {:?}", result);
    for handle in others {
        handle.abort();
    }
    if let Err(err) = context.import_offset.flush().await {
        warn!("failed to flush import offset on shutdown: {err}");
    }
    result?;
    Ok(())
}
