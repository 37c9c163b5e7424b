//! Read side of the persistent readings store.
//!
//! Stores are partitioned by `device_id` and scanned newest-first over an
//! inclusive timestamp range. Ties on `timestamp` are broken by insertion
//! sequence, so a [`Cursor`] of `(timestamp, seq)` resumes a scan exactly.

pub mod memory;
pub mod postgres;

use crate::errors::Result;
use crate::model::Numeric;
use async_trait::async_trait;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// A numeric field as the store encodes it, before normalisation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Int(i64),
    Float(f64),
    /// Fixed-point decimal in its text form, e.g. `"42.50"`.
    Decimal(String),
    Text(String),
    Null,
}

impl StoredValue {
    /// Integral values become `Int`, everything else numeric becomes `Float`.
    /// Null, text that is not a number, and non-finite values yield `None`.
    pub fn normalize(&self) -> Option<Numeric> {
        match self {
            StoredValue::Int(v) => Some(Numeric::Int(*v)),
            StoredValue::Float(v) if v.is_finite() => Some(Numeric::Float(*v)),
            StoredValue::Float(_) => None,
            StoredValue::Decimal(s) | StoredValue::Text(s) => parse_decimal(s),
            StoredValue::Null => None,
        }
    }
}

// beyond 2^53 an f64 no longer holds every integer
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

fn parse_decimal(text: &str) -> Option<Numeric> {
    let text = text.trim();
    if let Ok(v) = text.parse::<i64>() {
        return Some(Numeric::Int(v));
    }

    let v: f64 = text.parse().ok()?;
    if !v.is_finite() {
        return None;
    }
    if v.fract() == 0.0 && v.abs() < MAX_EXACT_INT {
        Some(Numeric::Int(v as i64))
    } else {
        Some(Numeric::Float(v))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredReading {
    /// Insertion sequence, unique per store.
    pub seq: i64,
    pub device_id: String,
    pub timestamp: i64,
    pub message_id: StoredValue,
    pub value: StoredValue,
    pub status: Option<String>,
    pub message: Option<String>,
}

/// Position just past the last item of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub timestamp: i64,
    pub seq: i64,
}

impl From<&StoredReading> for Cursor {
    fn from(reading: &StoredReading) -> Self {
        Cursor {
            timestamp: reading.timestamp,
            seq: reading.seq,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub device_id: String,
    /// Inclusive lower bound, unix seconds.
    pub start: i64,
    /// Inclusive upper bound, unix seconds.
    pub end: i64,
    pub limit: usize,
    pub after: Option<Cursor>,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Newest first.
    pub items: Vec<StoredReading>,
    /// Set when the scan may continue past this page.
    pub next: Option<Cursor>,
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn query_range(&self, query: &RangeQuery) -> Result<Page>;
}
