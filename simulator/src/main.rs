mod telemetry;

use chrono::Utc;
use clap::Parser;
use dashboard::config::{MqttSettings, TlsFiles};
use dashboard::mqtt::mqtt_options;
use dashboard::store::PostgresStore;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, QoS};
use std::path::PathBuf;
use std::time::Duration;
use telemetry::generate_reading;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodic device-side publisher for the telemetry dashboard.
#[derive(Debug, Parser)]
#[command(name = "simulator", version, about)]
struct Args {
    #[arg(long, env = "MQTT_ENDPOINT", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 8883)]
    port: u16,

    #[arg(long, env = "MQTT_TOPIC", default_value = "rpi/data")]
    topic: String,

    /// Also used as the MQTT client id
    #[arg(long, env = "DEVICE_ID", default_value = "RaspberryPiEmulator1")]
    device_id: String,

    #[arg(long, env = "INTERVAL_SECS", default_value_t = 5)]
    interval_secs: u64,

    #[arg(long, env = "MQTT_TLS", default_value_t = true, action = clap::ArgAction::Set)]
    tls: bool,

    #[arg(long, env = "MQTT_CA_PATH", default_value = "AmazonRootCA1.pem")]
    ca_path: PathBuf,

    #[arg(long, env = "MQTT_CERT_PATH", default_value = "certificate.pem.crt")]
    cert_path: PathBuf,

    #[arg(long, env = "MQTT_KEY_PATH", default_value = "private.pem.key")]
    key_path: PathBuf,

    /// Write every reading to the store as well
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting device simulator");
    info!(
        "Broker: {}:{}, Topic: {}, Device: {}, Interval: {}s",
        args.broker, args.port, args.topic, args.device_id, args.interval_secs
    );

    let settings = MqttSettings {
        host: args.broker.clone(),
        port: args.port,
        client_id: args.device_id.clone(),
        topic: args.topic.clone(),
        tls: args.tls.then(|| TlsFiles {
            ca: args.ca_path.clone(),
            cert: args.cert_path.clone(),
            key: args.key_path.clone(),
        }),
        keep_alive: Duration::from_secs(60),
        connect_timeout: Duration::from_secs(10),
    };
    let (client, eventloop) = AsyncClient::new(mqtt_options(&settings)?, 100);

    let (stopping_tx, stopping_rx) = watch::channel(false);
    let mut eventloop_handle = tokio::spawn(drive_eventloop(eventloop, stopping_rx));

    let store = match &args.database_url {
        Some(url) => Some(PostgresStore::connect(url).await?),
        None => None,
    };

    info!("Publishing; press ctrl-c to stop");

    let mut rng = rand::thread_rng();
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    let mut message_count = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }

        message_count += 1;
        let reading = generate_reading(&mut rng, &args.device_id, message_count, Utc::now().timestamp());

        let payload = match serde_json::to_string(&reading) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize reading: {}", e);
                continue;
            }
        };

        info!("Publishing: {}", payload);
        if let Err(e) = client.publish(&args.topic, QoS::AtLeastOnce, false, payload).await {
            warn!("Failed to publish: {}", e);
        }

        if let Some(store) = &store {
            if let Err(e) = store.insert(&reading).await {
                warn!("Failed to store reading: {}", e);
            }
        }
    }

    stopping_tx.send_replace(true);
    if let Err(e) = client.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }

    // the DISCONNECT packet is only written while the event loop is polled
    if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut eventloop_handle)
        .await
        .is_err()
    {
        warn!("Broker did not take the disconnect in {:?}", DISCONNECT_TIMEOUT);
        eventloop_handle.abort();
    }

    Ok(())
}

/// Polls until the DISCONNECT has gone out, or until the connection fails once
/// a shutdown has been requested.
async fn drive_eventloop(mut eventloop: EventLoop, stopping: watch::Receiver<bool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnected from broker");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if *stopping.borrow() {
                    debug!("MQTT eventloop stopped: {}", e);
                    return;
                }
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::MqttOptions;

    #[tokio::test]
    async fn test_eventloop_exits_after_shutdown_request() {
        // nothing listens on the discard port
        let options = MqttOptions::new("simulator-test", "127.0.0.1", 9);
        let (_client, eventloop) = AsyncClient::new(options, 10);
        let (stopping_tx, stopping_rx) = watch::channel(false);
        stopping_tx.send_replace(true);

        let finished =
            tokio::time::timeout(Duration::from_secs(5), drive_eventloop(eventloop, stopping_rx)).await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_eventloop_keeps_retrying_while_running() {
        let options = MqttOptions::new("simulator-test", "127.0.0.1", 9);
        let (_client, eventloop) = AsyncClient::new(options, 10);
        let (_stopping_tx, stopping_rx) = watch::channel(false);

        let finished =
            tokio::time::timeout(Duration::from_millis(300), drive_eventloop(eventloop, stopping_rx)).await;
        assert!(finished.is_err());
    }
}
