//! Sensor reading and import task persistence for Hygrolog.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hygrolog_core::{ImportTask, ParsedReading, ReadingKey, ResolutionTally};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::{MemorySensorStore, MemoryTaskStore};
pub use postgres::{connect, run_migrations, upsert_readings_on, PgSensorStore, PgTaskStore};

pub const CRATE_NAME: &str = "hygrolog-storage";

/// Upper bound on keys or rows bound into a single statement.
pub const MAX_ROWS_PER_STATEMENT: usize = 1000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One row written through the keyed (area, timestamp) upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorUpsert {
    pub area_code: String,
    pub area_name: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<Decimal>,
    pub humidity: Option<Decimal>,
    pub file_source: String,
}

impl SensorUpsert {
    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            area_code: self.area_code.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[async_trait]
pub trait SensorStore: Send + Sync {
    /// Loads stored readings for exactly the given keys, flagged as existing.
    async fn existing_readings(&self, keys: &[ReadingKey]) -> StorageResult<Vec<ParsedReading>>;

    /// Inserts or overwrites readings keyed on (area, timestamp). Returns rows written.
    async fn upsert_readings(&self, rows: &[SensorUpsert]) -> StorageResult<u64>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &ImportTask) -> StorageResult<()>;

    async fn get_task(&self, task_id: Uuid) -> StorageResult<Option<ImportTask>>;

    /// Full overwrite of the task row as computed by the import pipeline.
    async fn save_task(&self, task: &ImportTask) -> StorageResult<()>;

    /// Adds one resolve call's counts to a task in a single write.
    async fn apply_tally(&self, tally: &ResolutionTally) -> StorageResult<()>;

    async fn tasks_for_batch(&self, batch_id: Uuid) -> StorageResult<Vec<ImportTask>>;

    async fn delete_batch_tasks(&self, batch_id: Uuid) -> StorageResult<u64>;
}

/// Collapses rows sharing a key so one statement never touches the same row twice; the last row wins.
pub fn dedupe_last_wins(rows: &[SensorUpsert]) -> Vec<SensorUpsert> {
    let mut order: Vec<ReadingKey> = Vec::with_capacity(rows.len());
    let mut latest: std::collections::HashMap<ReadingKey, &SensorUpsert> =
        std::collections::HashMap::with_capacity(rows.len());
    for row in rows {
        let key = row.key();
        if latest.insert(key.clone(), row).is_none() {
            order.push(key);
        }
    }
    order
        .into_iter()
        .filter_map(|key| latest.get(&key).map(|row| (*row).clone()))
        .collect()
}
