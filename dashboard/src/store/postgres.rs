use super::{Cursor, Page, RangeQuery, ReadingStore, StoredReading, StoredValue};
use crate::errors::Result;
use crate::model::{Numeric, Reading};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    seq: i64,
    device_id: String,
    ts: i64,
    message_id: Option<i64>,
    // NUMERIC read back in its decimal text form
    value: Option<String>,
    status: Option<String>,
    message: Option<String>,
}

impl From<ReadingRow> for StoredReading {
    fn from(row: ReadingRow) -> Self {
        StoredReading {
            seq: row.seq,
            device_id: row.device_id,
            timestamp: row.ts,
            message_id: row.message_id.map_or(StoredValue::Null, StoredValue::Int),
            value: row.value.map_or(StoredValue::Null, StoredValue::Decimal),
            status: row.status,
            message: row.message,
        }
    }
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(make_pool(database_url).await?))
    }

    /// Writes one reading; used by the device-side publisher, never by the dashboard.
    pub async fn insert(&self, reading: &Reading) -> Result<()> {
        let value = match reading.value {
            Numeric::Int(v) => v.to_string(),
            Numeric::Float(v) => v.to_string(),
        };
        let message_id = reading.message_id.and_then(|id| i64::try_from(id).ok());

        sqlx::query(
            r#"
            INSERT INTO readings (device_id, ts, message_id, value, status, message)
            VALUES ($1, $2, $3, $4::numeric, $5, $6)
            "#,
        )
        .bind(&reading.device_id)
        .bind(reading.timestamp)
        .bind(message_id)
        .bind(value)
        .bind(&reading.status)
        .bind(&reading.message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ReadingStore for PostgresStore {
    async fn query_range(&self, query: &RangeQuery) -> Result<Page> {
        let limit = query.limit as i64;
        let (after_ts, after_seq) = match query.after {
            Some(cursor) => (Some(cursor.timestamp), Some(cursor.seq)),
            None => (None, None),
        };

        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT seq, device_id, ts, message_id, value::text AS value, status, message
            FROM readings
            WHERE device_id = $1
              AND ts BETWEEN $2 AND $3
              AND ($4::bigint IS NULL OR (ts, seq) < ($4, $5))
            ORDER BY ts DESC, seq DESC
            LIMIT $6
            "#,
        )
        .bind(&query.device_id)
        .bind(query.start)
        .bind(query.end)
        .bind(after_ts)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let items: Vec<StoredReading> = rows.into_iter().map(StoredReading::from).collect();
        let next = if items.len() == query.limit {
            items.last().map(Cursor::from)
        } else {
            None
        };

        Ok(Page { items, next })
    }
}
