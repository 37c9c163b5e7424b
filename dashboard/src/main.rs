use axum::{routing::get, Router};
use clap::Parser;
use dashboard::config::Config;
use dashboard::relay::{run_relay, LiveRelay};
use dashboard::rest::{self, AppState};
use dashboard::store::{PostgresStore, ReadingStore};
use dashboard::{metrics, mqtt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    config.validate()?;

    info!("Starting telemetry dashboard");
    info!("HTTP server: {}", config.http_addr);

    metrics::init_metrics()?;

    let store: Option<Arc<dyn ReadingStore>> = match &config.database_url {
        Some(url) => {
            info!("Database: {}", url.split('@').last().unwrap_or("***"));
            match PostgresStore::connect(url).await {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    error!("Failed to connect to database: {}", e);
                    warn!("Historical data disabled");
                    None
                }
            }
        }
        None => {
            warn!("DATABASE_URL not set, historical data disabled");
            None
        }
    };

    let relay = LiveRelay::new(config.subscriber_queue);
    let (tx, rx) = mpsc::channel(config.ingest_channel_capacity);

    let relay_handle = tokio::spawn(run_relay(rx, relay.clone()));

    match config.mqtt_settings() {
        Some(settings) => {
            if mqtt::start(settings, tx.clone()).await {
                info!("Live ingestion running");
            } else {
                warn!("Live ingestion degraded, waiting for broker");
            }
        }
        None => warn!("MQTT_ENDPOINT not set, no live data will arrive"),
    }

    let state = AppState {
        relay,
        store,
        default_device_id: config.default_device_id.clone(),
        heartbeat: config.heartbeat(),
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    // the relay runs until shutdown even when nothing feeds it
    let _ingest = tx;

    tokio::select! {
        _ = relay_handle => {
            error!("Live relay terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
