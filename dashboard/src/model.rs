use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A sensor value as the device reported it: integral or floating point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Int(i64),
    Float(f64),
}

impl Numeric {
    pub fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(v) => v as f64,
            Numeric::Float(v) => v,
        }
    }
}

impl From<i64> for Numeric {
    fn from(v: i64) -> Self {
        Numeric::Int(v)
    }
}

impl From<f64> for Numeric {
    fn from(v: f64) -> Self {
        Numeric::Float(v)
    }
}

/// One timestamped sample published by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    /// Unix seconds, as reported by the device.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
    // Older publishers spell the field "sendor data".
    #[serde(alias = "sendor data", alias = "sendor_data")]
    pub value: Numeric,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

pub fn default_status() -> String {
    "active".to_string()
}

/// The most recent reading seen by the relay, stamped at decode time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveSnapshot {
    pub topic: String,
    pub payload: Reading,
    /// Receipt time in unix seconds.
    pub timestamp: i64,
    pub received_at: DateTime<Utc>,
}

impl LiveSnapshot {
    pub fn new(topic: impl Into<String>, payload: Reading, received_at: DateTime<Utc>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: received_at.timestamp(),
            received_at,
        }
    }
}

/// A stored reading after numeric normalisation, as served by `/api/historical`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricalRecord {
    pub device_id: String,
    pub timestamp: i64,
    pub formatted_time: String,
    pub message: String,
    pub message_id: Option<Numeric>,
    pub status: String,
    pub value: Option<Numeric>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub total_readings: usize,
    pub average_value: f64,
    pub min_value: f64,
    pub max_value: f64,
}

#[derive(Debug, Serialize)]
pub struct LatestResponse<'a> {
    pub success: bool,
    pub data: &'a LiveSnapshot,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct HistoricalResponse {
    pub success: bool,
    pub count: usize,
    pub data: Vec<HistoricalRecord>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub success: bool,
    pub stats: Stats,
}

/// `success: false` envelope. Historical failures carry `error`, the others `message`.
#[derive(Debug, Serialize)]
pub struct Failure {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Failure {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}
