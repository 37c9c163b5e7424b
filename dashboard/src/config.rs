use crate::errors::{Error, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Live telemetry dashboard server.
#[derive(Debug, Clone, Parser)]
#[command(name = "dashboard", version, about)]
pub struct Config {
    /// Address the HTTP server binds to
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:5000")]
    pub http_addr: String,

    /// Postgres URL of the readings store; historical endpoints report
    /// "not connected" without it
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// MQTT broker host; no live data is ingested without it
    #[arg(long, env = "MQTT_ENDPOINT")]
    pub mqtt_endpoint: Option<String>,

    #[arg(long, env = "MQTT_PORT", default_value_t = 8883)]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_TOPIC", default_value = "rpi/data")]
    pub mqtt_topic: String,

    /// Defaults to `dashboard-<uuid>`
    #[arg(long, env = "MQTT_CLIENT_ID")]
    pub mqtt_client_id: Option<String>,

    /// Use TLS client authentication against the broker
    #[arg(long, env = "MQTT_TLS", default_value_t = true, action = clap::ArgAction::Set)]
    pub mqtt_tls: bool,

    #[arg(long, env = "MQTT_CA_PATH", default_value = "AmazonRootCA1.pem")]
    pub mqtt_ca_path: PathBuf,

    #[arg(long, env = "MQTT_CERT_PATH", default_value = "certificate.pem.crt")]
    pub mqtt_cert_path: PathBuf,

    #[arg(long, env = "MQTT_KEY_PATH", default_value = "private.pem.key")]
    pub mqtt_key_path: PathBuf,

    #[arg(long, env = "MQTT_KEEP_ALIVE_SECS", default_value_t = 60)]
    pub mqtt_keep_alive_secs: u64,

    #[arg(long, env = "MQTT_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub mqtt_connect_timeout_secs: u64,

    /// Device queried when a request names none
    #[arg(long, env = "DEFAULT_DEVICE_ID", default_value = "RaspberryPiEmulator1")]
    pub default_device_id: String,

    /// Idle seconds before a push stream sends a heartbeat
    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Readings buffered per live viewer before the oldest are dropped
    #[arg(long, env = "SUBSCRIBER_QUEUE", default_value_t = 64)]
    pub subscriber_queue: usize,

    #[arg(long, env = "INGEST_CHANNEL_CAPACITY", default_value_t = 1024)]
    pub ingest_channel_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    pub tls: Option<TlsFiles>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_secs == 0 {
            return Err(Error::Validation("heartbeat interval must be positive".to_string()));
        }
        if self.subscriber_queue == 0 || self.ingest_channel_capacity == 0 {
            return Err(Error::Validation("queue sizes must be positive".to_string()));
        }
        if self.mqtt_connect_timeout_secs == 0 {
            return Err(Error::Validation("connect timeout must be positive".to_string()));
        }
        // rumqttc rejects keep-alive intervals below five seconds
        if self.mqtt_keep_alive_secs < 5 {
            return Err(Error::Validation(
                "MQTT keep-alive must be at least 5 seconds".to_string(),
            ));
        }
        if self.default_device_id.trim().is_empty() {
            return Err(Error::Validation("default device id cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// `None` when no broker endpoint is configured.
    pub fn mqtt_settings(&self) -> Option<MqttSettings> {
        let host = self.mqtt_endpoint.clone()?;
        let client_id = self
            .mqtt_client_id
            .clone()
            .unwrap_or_else(|| format!("dashboard-{}", uuid::Uuid::new_v4()));
        let tls = self.mqtt_tls.then(|| TlsFiles {
            ca: self.mqtt_ca_path.clone(),
            cert: self.mqtt_cert_path.clone(),
            key: self.mqtt_key_path.clone(),
        });

        Some(MqttSettings {
            host,
            port: self.mqtt_port,
            client_id,
            topic: self.mqtt_topic.clone(),
            tls,
            keep_alive: Duration::from_secs(self.mqtt_keep_alive_secs),
            connect_timeout: Duration::from_secs(self.mqtt_connect_timeout_secs),
        })
    }
}
