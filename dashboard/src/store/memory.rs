use super::{Cursor, Page, RangeQuery, ReadingStore, StoredReading, StoredValue};
use crate::errors::Result;
use crate::model::{Numeric, Reading};
use async_trait::async_trait;
use std::sync::Mutex;

/// In-process store with the same ordering and paging as the database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: Mutex<Vec<StoredReading>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw record; `seq` is assigned here.
    pub fn insert_raw(&self, mut reading: StoredReading) {
        let mut readings = self.lock();
        reading.seq = readings.len() as i64 + 1;
        readings.push(reading);
    }

    pub fn insert(&self, reading: &Reading) {
        let value = match reading.value {
            Numeric::Int(v) => StoredValue::Int(v),
            Numeric::Float(v) => StoredValue::Float(v),
        };
        let message_id = reading
            .message_id
            .and_then(|id| i64::try_from(id).ok())
            .map_or(StoredValue::Null, StoredValue::Int);

        self.insert_raw(StoredReading {
            seq: 0,
            device_id: reading.device_id.clone(),
            timestamp: reading.timestamp,
            message_id,
            value,
            status: Some(reading.status.clone()),
            message: Some(reading.message.clone()),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredReading>> {
        // a panic while holding the lock cannot leave the Vec half-written
        self.readings.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn query_range(&self, query: &RangeQuery) -> Result<Page> {
        let readings = self.lock();

        let mut matching: Vec<&StoredReading> = readings
            .iter()
            .filter(|r| r.device_id == query.device_id)
            .filter(|r| r.timestamp >= query.start && r.timestamp <= query.end)
            .filter(|r| match query.after {
                Some(c) => (r.timestamp, r.seq) < (c.timestamp, c.seq),
                None => true,
            })
            .collect();
        matching.sort_by(|a, b| (b.timestamp, b.seq).cmp(&(a.timestamp, a.seq)));

        let more = matching.len() > query.limit;
        let items: Vec<StoredReading> = matching
            .into_iter()
            .take(query.limit)
            .cloned()
            .collect();
        let next = if more { items.last().map(Cursor::from) } else { None };

        Ok(Page { items, next })
    }
}
