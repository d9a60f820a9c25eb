//! Modbus RTU/TCP gateway.
//!
//! Polls the configured devices, publishes their values to Zenoh, and answers
//! control commands on the control queryable.

use anyhow::{Context, Result, bail};
use fieldgate_framework::{
    DEFAULT_HEARTBEAT, GatewayArgs, GatewayConfig, GatewayHealth, GatewayRunner,
    LivelinessManager, MetadataFn, shutdown_signal,
};
use fieldgate_modbus::config::ModbusGatewayConfig;
use fieldgate_modbus::gateway::{TelemetryMapper, event_callbacks, handle_control, run_events};
use fieldgate_modbus::{Registry, TaskPool};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

const GATEWAY_NAME: &str = "modbus";

#[tokio::main]
async fn main() -> Result<()> {
    let args = GatewayArgs::parse_with_default("modbus.json5");

    let config = ModbusGatewayConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    let settings = config.gateway.clone();

    let mut runner = GatewayRunner::new_with_args(GATEWAY_NAME, config, Some(&args))
        .await
        .context("Failed to start gateway")?;
    let session = Arc::clone(runner.session());
    let publisher = runner.publisher();

    let liveliness = Arc::new(LivelinessManager::new(
        Arc::clone(&session),
        publisher.key_prefix(),
    ));
    let health = Arc::new(
        GatewayHealth::new(GATEWAY_NAME)
            .with_publisher(publisher.clone())
            .with_liveliness(Arc::clone(&liveliness)),
    );

    let inventory = settings.inventory();
    let registry = Registry::with_defaults(settings.connector_options(), settings.codec_options());
    let (events, rx) = mpsc::unbounded_channel();
    let pool = Arc::new(
        TaskPool::build(
            &inventory,
            &registry,
            &event_callbacks(events),
            settings.retry_policy(),
        )
        .await,
    );
    if pool.is_empty() {
        bail!("None of the configured devices could be set up");
    }
    health.set_devices_total(pool.len() as u64);

    let mapper = TelemetryMapper::from_inventory(&inventory).await;
    runner.spawn(run_events(rx, mapper, publisher.clone(), Arc::clone(&health)));

    let periodic = Arc::clone(&health);
    runner.spawn(async move {
        let mut ticker = tokio::time::interval(DEFAULT_HEARTBEAT);
        loop {
            ticker.tick().await;
            if let Err(e) = periodic.publish_health().await {
                warn!(error = %e, "Failed to publish health");
            }
        }
    });

    runner.spawn_with_error(
        "control",
        serve_control(session, publisher.keys().control_key(), Arc::clone(&pool)),
    );

    pool.start_all();
    info!(devices = pool.len(), "Task processors started");

    let status_health = Arc::clone(&health);
    let metadata: MetadataFn = Arc::new(move || {
        let snapshot = status_health.snapshot();
        serde_json::json!({
            "devices_total": snapshot.devices_total,
            "devices_online": snapshot.devices_online,
            "devices_offline": snapshot.devices_offline,
        })
    });
    let runner = runner.with_status(Some(metadata), None);

    runner
        .run_until(shutdown_signal(), async move {
            pool.shutdown().await;
            liveliness.undeclare_all_devices().await;
        })
        .await?;

    Ok(())
}

/// Answer control queries until the session closes.
async fn serve_control(
    session: Arc<zenoh::Session>,
    key: String,
    pool: Arc<TaskPool>,
) -> Result<(), zenoh::Error> {
    let queryable = session.declare_queryable(&key).await?;
    info!(key = %key, "Control queryable declared");

    while let Ok(query) = queryable.recv_async().await {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let payload = query
                .payload()
                .map(|p| p.to_bytes().into_owned())
                .unwrap_or_default();

            let answered = match handle_control(&pool, &payload).await {
                Ok(reply) => match serde_json::to_vec(&reply) {
                    Ok(body) => query.reply(query.key_expr().clone(), body).await,
                    Err(e) => query.reply_err(e.to_string()).await,
                },
                Err(e) => {
                    warn!(error = %e, "Control command failed");
                    query.reply_err(e.to_string()).await
                }
            };
            if let Err(e) = answered {
                warn!(error = %e, "Failed to answer control query");
            }
        });
    }
    Ok(())
}
