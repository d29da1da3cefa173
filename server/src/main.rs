mod api;
mod db;
mod discovery;
mod entity_service;
mod health;
mod metrics;
mod plugin;
mod poller;
mod scheduler;

use crate::entity_service::store::PgEntityStore;
use crate::entity_service::EntityService;
use crate::metrics::reader::{MetricsReader, PgMetricSource};
use crate::metrics::writer::{MetricsWriter, PgMetricSink};
use crate::plugin::pool::PluginPool;
use crate::plugin::{PluginResult, PluginTask, DISCOVERY_FLAG};
use crate::poller::Poller;
use crate::scheduler::ping::FpingProbe;
use crate::scheduler::Scheduler;
use anyhow::Context;
use log::{error, info};
use nms_shared::bus::{
    DATA_CHANNEL_CAPACITY, DISPATCH_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY, EntityHandle,
};
use nms_shared::config::Config;
use nms_shared::crypto::PayloadCipher;
use nms_shared::os::stopper::Stopper;
use nms_shared::NMS_NAMESPACE;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Grace period for draining tasks after the stop signal.
const SHUTDOWN_GRACE_SECS: u64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init()?;
    info!("{} server start", NMS_NAMESPACE);

    let config = Config::load()?;
    let cipher = PayloadCipher::from_base64_key(&config.crypto.key)
        .map_err(|e| anyhow::anyhow!("crypto.key is unusable: {}", e))?;

    let read_pool = db::connect(&config.database.url, config.database.read_max_connections).await?;
    let write_pool = db::connect(&config.database.url, config.database.write_max_connections).await?;
    db::schema::ensure_schema(&read_pool)
        .await
        .context("schema bootstrap failed")?;

    let stopper = Stopper::hooked_to_signals();

    // Channel fabric: request/control/event channels at medium capacity,
    // scheduler dispatch small, poll result batches large.
    let (request_tx, request_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (discovered_tx, discovered_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (run_discovery_tx, run_discovery_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_CHANNEL_CAPACITY);
    let (failure_tx, failure_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (poll_results_tx, poll_results_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
    let (metric_query_tx, metric_query_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let entity = EntityHandle::new(request_tx, control_tx);

    let mut entity_service = EntityService::new(
        PgEntityStore::new(read_pool.clone()),
        request_rx,
        control_rx,
        discovered_rx,
        run_discovery_tx,
        stopper.clone(),
    );
    let device_events_rx = entity_service.subscribe_device_events(EVENT_CHANNEL_CAPACITY);
    entity_service
        .load()
        .await
        .map_err(|e| anyhow::anyhow!("cache load failed: {}", e))?;
    let seed_ids = entity_service.active_device_ids();

    let mut scheduler = Scheduler::new(
        &config.scheduler,
        entity.clone(),
        dispatch_tx,
        failure_tx.clone(),
        device_events_rx,
        FpingProbe::new(&config.ping),
        stopper.clone(),
    );
    scheduler.seed(seed_ids);

    let plugin_dir = PathBuf::from(&config.plugins.directory);
    let (poll_pool, poll_pool_results) = PluginPool::<PluginTask>::start::<PluginResult>(
        "poller",
        config.plugins.poll_workers,
        config.plugins.job_buffer,
        Vec::new(),
        stopper.clone(),
    );
    let (discovery_pool, discovery_pool_results) = PluginPool::<PluginTask>::start::<PluginResult>(
        "discovery",
        config.plugins.discovery_workers,
        config.plugins.job_buffer,
        vec![DISCOVERY_FLAG.to_string()],
        stopper.clone(),
    );

    let poller = Poller::new(
        dispatch_rx,
        entity.clone(),
        poll_pool,
        plugin_dir.clone(),
        cipher.clone(),
        stopper.clone(),
    );
    let pending: discovery::PendingContexts = Arc::new(RwLock::new(HashMap::new()));
    let discovery_service = discovery::DiscoveryService::new(
        run_discovery_rx,
        discovery_pool,
        pending.clone(),
        plugin_dir,
        cipher.clone(),
        stopper.clone(),
    );
    let writer = MetricsWriter::new(
        PgMetricSink::new(write_pool),
        poll_results_rx,
        failure_tx,
        stopper.clone(),
    );
    let reader = MetricsReader::new(
        PgMetricSource::new(read_pool),
        metric_query_rx,
        &config.metrics,
        stopper.clone(),
    );
    let health_monitor = health::HealthMonitor::new(
        &config.health,
        failure_rx,
        entity.clone(),
        stopper.clone(),
    );

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(entity_service.run()));
    tasks.push(tokio::spawn(scheduler.run()));
    tasks.push(tokio::spawn(poller.run()));
    tasks.push(tokio::spawn(poller::forward_results(
        poll_pool_results,
        poll_results_tx,
        stopper.clone(),
    )));
    tasks.push(tokio::spawn(discovery_service.run()));
    tasks.push(tokio::spawn(discovery::collect_results(
        discovery_pool_results,
        pending,
        discovered_tx,
        stopper.clone(),
    )));
    tasks.push(tokio::spawn(writer.run()));
    tasks.push(tokio::spawn(reader.run()));
    tasks.push(tokio::spawn(health_monitor.run()));

    let state = api::ApiState::new(&config.server, entity, metric_query_tx, cipher);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;
    info!("main - API listening on {}", config.server.bind_address);
    let shutdown = stopper.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::router(state))
            .with_graceful_shutdown(async move { shutdown.stopped().await })
            .await
        {
            error!("main - HTTP server error: {}", e);
        }
    }));

    stopper.stopped().await;
    info!("main - shutdown signal received, draining tasks");
    if tokio::time::timeout(
        Duration::from_secs(SHUTDOWN_GRACE_SECS),
        futures::future::join_all(tasks),
    )
    .await
    .is_err()
    {
        error!("main - some tasks did not drain within the grace period");
    }
    info!("{} server end", NMS_NAMESPACE);
    Ok(())
}
