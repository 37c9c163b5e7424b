use crate::config::{MqttSettings, TlsFiles};
use crate::errors::{Error, Result};
use crate::metrics::{INVALID_MESSAGES_TOTAL, MESSAGES_TOTAL, VALID_MESSAGES_TOTAL};
use crate::model::{LiveSnapshot, Reading};
use crate::validate::validate;
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 10;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Builds broker options, loading the TLS client identity when configured.
pub fn mqtt_options(settings: &MqttSettings) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);

    if let Some(files) = &settings.tls {
        options.set_transport(Transport::tls_with_config(load_tls(files)?));
    }

    Ok(options)
}

/// rustls negotiates TLS 1.2 or newer only.
fn load_tls(files: &TlsFiles) -> Result<TlsConfiguration> {
    let read = |path: &std::path::Path| {
        std::fs::read(path)
            .map_err(|e| Error::Tls(format!("cannot read {}: {}", path.display(), e)))
    };

    Ok(TlsConfiguration::Simple {
        ca: read(&files.ca)?,
        alpn: None,
        client_auth: Some((read(&files.cert)?, read(&files.key)?)),
    })
}

/// Connects to the broker and keeps the subscription running in the background.
///
/// Returns whether the first connection was acknowledged within the connect
/// timeout. The event loop keeps retrying either way, so a broker that comes up
/// late still starts the live feed.
pub async fn start(settings: MqttSettings, tx: mpsc::Sender<LiveSnapshot>) -> bool {
    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        settings.host, settings.port, settings.client_id
    );

    let options = match mqtt_options(&settings) {
        Ok(options) => options,
        Err(e) => {
            error!("MQTT client setup failed: {}", e);
            return false;
        }
    };

    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let (connected_tx, connected_rx) = oneshot::channel();
    let connect_timeout = settings.connect_timeout;

    tokio::spawn(async move {
        if let Err(e) = run_mqtt(client, eventloop, settings.topic, tx, Some(connected_tx)).await {
            error!("MQTT task failed: {}", e);
        }
    });

    match tokio::time::timeout(connect_timeout, connected_rx).await {
        Ok(Ok(())) => {
            info!("MQTT client started");
            true
        }
        _ => {
            warn!(
                "No MQTT connection after {:?}, running without live data",
                connect_timeout
            );
            false
        }
    }
}

pub async fn run_mqtt(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topic: String,
    tx: mpsc::Sender<LiveSnapshot>,
    mut on_connect: Option<oneshot::Sender<()>>,
) -> Result<()> {
    // device timestamps are only ordered within one connection
    let mut last_timestamp: Option<i64> = None;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    warn!("MQTT connection refused: {:?}", ack.code);
                    continue;
                }
                info!("MQTT connected, subscribing to {}", topic);
                subscribe(&client, &topic);
                last_timestamp = None;

                if let Some(signal) = on_connect.take() {
                    let _ = signal.send(());
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                handle_publish(&publish.topic, &publish.payload, &tx, &mut last_timestamp).await?;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
        }
    }
}

/// Queues the topic subscription. A failure is logged and retried on the next
/// ConnAck; it never stops the event loop.
fn subscribe(client: &AsyncClient, topic: &str) -> bool {
    match client.try_subscribe(topic, QoS::AtLeastOnce) {
        Ok(()) => true,
        Err(e) => {
            error!("MQTT subscribe to {} failed: {}", topic, e);
            false
        }
    }
}

/// Decodes one publish and forwards it to the relay. Malformed payloads are
/// logged and dropped; only a closed relay channel is an error.
pub async fn handle_publish(
    topic: &str,
    payload: &[u8],
    tx: &mpsc::Sender<LiveSnapshot>,
    last_timestamp: &mut Option<i64>,
) -> Result<()> {
    MESSAGES_TOTAL.inc();
    debug!("Received message on topic {}, size: {} bytes", topic, payload.len());

    let snapshot = match decode_message(topic, payload, Utc::now()) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Discarding malformed message on {}: {}", topic, e);
            INVALID_MESSAGES_TOTAL.inc();
            return Ok(());
        }
    };
    VALID_MESSAGES_TOTAL.inc();

    let ts = snapshot.payload.timestamp;
    if let Some(last) = *last_timestamp {
        if ts < last {
            warn!(
                "Out-of-order reading from {}: {} after {}",
                snapshot.payload.device_id, ts, last
            );
        }
    }
    *last_timestamp = Some(last_timestamp.map_or(ts, |last| last.max(ts)));

    forward(tx, snapshot).await
}

/// Decodes one inbound payload into a stamped snapshot
pub fn decode_message(
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<LiveSnapshot> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::Validation(format!("payload is not UTF-8: {}", e)))?;
    let reading: Reading = serde_json::from_str(text)?;
    validate(&reading)?;

    Ok(LiveSnapshot::new(topic, reading, received_at))
}

async fn forward(tx: &mpsc::Sender<LiveSnapshot>, snapshot: LiveSnapshot) -> Result<()> {
    match tx.try_send(snapshot) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(snapshot)) => {
            debug!("Ingest channel full, waiting for relay");
            tx.send(snapshot).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Ingest channel closed, cannot forward reading");
            Err(Error::ChannelSend)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Numeric;
    use crate::relay::{run_relay, LiveRelay};

    const PAYLOAD: &[u8] = br#"{"device_id":"RaspberryPiEmulator1","timestamp":1700000000,"message_id":3,"value":42,"status":"active","message":"sensor reading"}"#;

    #[test]
    fn test_decode_valid() {
        let now = Utc::now();
        let snapshot = decode_message("rpi/data", PAYLOAD, now).unwrap();

        assert_eq!(snapshot.topic, "rpi/data");
        assert_eq!(snapshot.payload.device_id, "RaspberryPiEmulator1");
        assert_eq!(snapshot.payload.value, Numeric::Int(42));
        assert_eq!(snapshot.received_at, now);
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(matches!(
            decode_message("rpi/data", b"invalid json", Utc::now()),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        assert!(matches!(
            decode_message("rpi/data", &[0xff, 0xfe, 0x00], Utc::now()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_decode_empty_device() {
        let payload = br#"{"device_id":"","timestamp":1700000000,"value":1}"#;
        assert!(decode_message("rpi/data", payload, Utc::now()).is_err());
    }

    #[test]
    fn test_decode_non_numeric_value() {
        let payload = br#"{"device_id":"dev","timestamp":1700000000,"value":"high"}"#;
        assert!(decode_message("rpi/data", payload, Utc::now()).is_err());
    }

    #[test]
    fn test_decode_accepts_long_status() {
        let payload = format!(
            r#"{{"device_id":"d","timestamp":1,"value":1,"status":"{}"}}"#,
            "x".repeat(65)
        );
        let snapshot = decode_message("t", payload.as_bytes(), Utc::now()).unwrap();
        assert_eq!(snapshot.payload.status.len(), 65);
    }

    #[tokio::test]
    async fn test_malformed_publish_leaves_latest_untouched() {
        let relay = LiveRelay::new(8);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_relay(rx, relay.clone()));
        let mut last_timestamp = None;

        handle_publish("rpi/data", PAYLOAD, &tx, &mut last_timestamp)
            .await
            .unwrap();
        handle_publish("rpi/data", b"\x00not json", &tx, &mut last_timestamp)
            .await
            .unwrap();
        handle_publish("rpi/data", br#"{"device_id":"","timestamp":1,"value":1}"#, &tx, &mut last_timestamp)
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        let latest = relay.latest().unwrap();
        assert_eq!(latest.payload.message_id, Some(3));
        assert_eq!(latest.payload.value, Numeric::Int(42));
        assert_eq!(last_timestamp, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_nothing_published_for_malformed_only() {
        let relay = LiveRelay::new(8);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_relay(rx, relay.clone()));
        let mut last_timestamp = None;

        handle_publish("rpi/data", b"invalid json", &tx, &mut last_timestamp)
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(relay.latest().is_none());
        assert_eq!(last_timestamp, None);
    }

    #[test]
    fn test_forward_delivers() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(10);
            let snapshot = decode_message("rpi/data", PAYLOAD, Utc::now()).unwrap();

            assert!(forward(&tx, snapshot).await.is_ok());

            let received = rx.recv().await.unwrap();
            assert_eq!(received.payload.message_id, Some(3));
        });
    }

    #[test]
    fn test_forward_closed_channel() {
        tokio_test::block_on(async {
            let (tx, rx) = mpsc::channel(1);
            drop(rx);
            let snapshot = decode_message("rpi/data", PAYLOAD, Utc::now()).unwrap();

            assert!(matches!(forward(&tx, snapshot).await, Err(Error::ChannelSend)));
        });
    }

    #[test]
    fn test_subscribe_failure_is_not_fatal() {
        let options = MqttOptions::new("dashboard-test", "localhost", 1883);
        // nothing polls this event loop, so its one-slot request queue stays full
        let (client, _eventloop) = AsyncClient::new(options, 1);

        assert!(subscribe(&client, "rpi/data"));
        assert!(!subscribe(&client, "rpi/data"));
    }

    #[test]
    fn test_options_without_tls() {
        let settings = MqttSettings {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "dashboard-test".to_string(),
            topic: "rpi/data".to_string(),
            tls: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
        };

        let options = mqtt_options(&settings).unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_options_missing_certificates() {
        let settings = MqttSettings {
            host: "localhost".to_string(),
            port: 8883,
            client_id: "dashboard-test".to_string(),
            topic: "rpi/data".to_string(),
            tls: Some(TlsFiles {
                ca: "/nonexistent/ca.pem".into(),
                cert: "/nonexistent/cert.pem".into(),
                key: "/nonexistent/key.pem".into(),
            }),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
        };

        assert!(matches!(mqtt_options(&settings), Err(Error::Tls(_))));
    }

    #[tokio::test]
    async fn test_start_reports_unreachable_broker() {
        let settings = MqttSettings {
            host: "127.0.0.1".to_string(),
            // nothing listens on the discard port
            port: 9,
            client_id: "dashboard-test".to_string(),
            topic: "rpi/data".to_string(),
            tls: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_millis(300),
        };
        let (tx, _rx) = mpsc::channel(1);

        assert!(!start(settings, tx).await);
    }
}
