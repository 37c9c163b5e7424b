//! Historical queries and trailing-window statistics over the readings store.

use crate::errors::{Error, Result};
use crate::metrics::{STORE_FAILURES_TOTAL, STORE_LATENCY_SECONDS, STORE_QUERIES_TOTAL};
use crate::model::{HistoricalRecord, Stats};
use crate::store::{Page, RangeQuery, ReadingStore, StoredReading};
use chrono::DateTime;
use tokio::time::Instant;
use tracing::{debug, error};

pub const DEFAULT_HOURS: u32 = 24;
pub const MAX_HISTORICAL_RESULTS: usize = 100;
pub const STATS_WINDOW_SECS: i64 = 3600;
const STATS_PAGE_SIZE: usize = 500;

/// Absent means the default window; anything present must be a positive integer.
pub fn parse_hours(raw: Option<&str>) -> Result<u32> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_HOURS);
    };

    let hours: u32 = raw
        .trim()
        .parse()
        .map_err(|_| Error::InvalidQuery(format!("hours must be a positive integer, got {:?}", raw)))?;
    if hours == 0 {
        return Err(Error::InvalidQuery("hours must be at least 1".to_string()));
    }

    Ok(hours)
}

/// Readings for one device in `[now - hours, now]`, newest first, at most 100.
pub async fn historical(
    store: &dyn ReadingStore,
    device_id: &str,
    hours: u32,
    now: i64,
) -> Result<Vec<HistoricalRecord>> {
    let query = RangeQuery {
        device_id: device_id.to_string(),
        start: now - i64::from(hours) * 3600,
        end: now,
        limit: MAX_HISTORICAL_RESULTS,
        after: None,
    };

    let page = timed_query(store, &query).await?;
    debug!("Historical query for {} returned {} rows", device_id, page.items.len());

    Ok(page.items.into_iter().map(to_record).collect())
}

/// Statistics over the trailing hour; `None` when the window is empty.
pub async fn stats(store: &dyn ReadingStore, device_id: &str, now: i64) -> Result<Option<Stats>> {
    let mut query = RangeQuery {
        device_id: device_id.to_string(),
        start: now - STATS_WINDOW_SECS,
        end: now,
        limit: STATS_PAGE_SIZE,
        after: None,
    };

    let mut readings = Vec::new();
    loop {
        let page = timed_query(store, &query).await?;
        readings.extend(page.items);
        match page.next {
            Some(cursor) => query.after = Some(cursor),
            None => break,
        }
    }

    Ok(compute_stats(&readings))
}

/// Records whose value is not numeric count toward the total only.
pub fn compute_stats(readings: &[StoredReading]) -> Option<Stats> {
    if readings.is_empty() {
        return None;
    }

    let values: Vec<f64> = readings
        .iter()
        .filter_map(|r| r.value.normalize())
        .map(|v| v.as_f64())
        .collect();

    if values.is_empty() {
        return Some(Stats {
            total_readings: readings.len(),
            average_value: 0.0,
            min_value: 0.0,
            max_value: 0.0,
        });
    }

    let sum: f64 = values.iter().sum();
    let average = sum / values.len() as f64;

    Some(Stats {
        total_readings: readings.len(),
        average_value: (average * 100.0).round() / 100.0,
        min_value: values.iter().copied().fold(f64::INFINITY, f64::min),
        max_value: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    })
}

/// `YYYY-MM-DD HH:MM:SS` in UTC.
pub fn format_timestamp(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn to_record(reading: StoredReading) -> HistoricalRecord {
    HistoricalRecord {
        formatted_time: format_timestamp(reading.timestamp),
        value: reading.value.normalize(),
        message_id: reading.message_id.normalize(),
        device_id: reading.device_id,
        timestamp: reading.timestamp,
        message: reading.message.unwrap_or_default(),
        status: reading.status.unwrap_or_else(crate::model::default_status),
    }
}

async fn timed_query(store: &dyn ReadingStore, query: &RangeQuery) -> Result<Page> {
    STORE_QUERIES_TOTAL.inc();
    let start = Instant::now();

    let result = store.query_range(query).await;
    STORE_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

    if let Err(e) = &result {
        STORE_FAILURES_TOTAL.inc();
        error!("Store query for {} failed: {}", query.device_id, e);
    }
    result
}
