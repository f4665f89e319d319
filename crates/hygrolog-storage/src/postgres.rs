use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hygrolog_core::{
    ImportTask, ParsedReading, ReadingKey, ResolutionAction, ResolutionTally, TaskCounters,
    TaskStatus,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::{
    dedupe_last_wins, SensorStore, SensorUpsert, StorageError, StorageResult, TaskStore,
    MAX_ROWS_PER_STATEMENT,
};

pub async fn connect(database_url: &str) -> StorageResult<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await?)
}

pub async fn run_migrations(pool: &PgPool) -> StorageResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgSensorStore {
    pool: PgPool,
}

impl PgSensorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SensorStore for PgSensorStore {
    async fn existing_readings(&self, keys: &[ReadingKey]) -> StorageResult<Vec<ParsedReading>> {
        let mut out = Vec::new();
        for chunk in keys.chunks(MAX_ROWS_PER_STATEMENT) {
            let codes = chunk.iter().map(|k| k.area_code.clone()).collect::<Vec<_>>();
            let stamps = chunk.iter().map(|k| k.timestamp).collect::<Vec<_>>();
            let rows = sqlx::query(
                r#"
                SELECT a.code AS area_code,
                       a.name AS area_name,
                       s.recorded_at,
                       s.temperature,
                       s.humidity,
                       s.file_source
                  FROM UNNEST($1::text[], $2::timestamptz[]) AS k(area_code, recorded_at)
                  JOIN areas a ON a.code = k.area_code
                  JOIN sensor_readings s
                    ON s.area_id = a.id
                   AND s.recorded_at = k.recorded_at
                "#,
            )
            .bind(&codes)
            .bind(&stamps)
            .fetch_all(&self.pool)
            .await?;

            for row in rows {
                out.push(ParsedReading {
                    area_code: row.try_get("area_code")?,
                    area_name: row.try_get("area_name")?,
                    timestamp: row.try_get("recorded_at")?,
                    temperature: row.try_get::<Option<Decimal>, _>("temperature")?,
                    humidity: row.try_get::<Option<Decimal>, _>("humidity")?,
                    file_source: row.try_get("file_source")?,
                    is_existing: true,
                });
            }
        }
        debug!(keys = keys.len(), found = out.len(), "loaded existing readings");
        Ok(out)
    }

    async fn upsert_readings(&self, rows: &[SensorUpsert]) -> StorageResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let written = upsert_readings_on(&mut *tx, rows).await?;
        tx.commit().await?;
        Ok(written)
    }
}

async fn ensure_areas(conn: &mut PgConnection, rows: &[SensorUpsert]) -> StorageResult<()> {
    let areas: BTreeMap<&str, &str> = rows
        .iter()
        .map(|r| (r.area_code.as_str(), r.area_name.as_str()))
        .collect();
    let codes = areas.keys().map(|c| c.to_string()).collect::<Vec<_>>();
    let names = areas.values().map(|n| n.to_string()).collect::<Vec<_>>();
    sqlx::query(
        r#"
        INSERT INTO areas (code, name)
        SELECT * FROM UNNEST($1::text[], $2::text[])
        ON CONFLICT (code) DO NOTHING
        "#,
    )
    .bind(&codes)
    .bind(&names)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Keyed (area, timestamp) upsert on an existing connection or transaction. Returns rows written.
pub async fn upsert_readings_on(conn: &mut PgConnection, rows: &[SensorUpsert]) -> StorageResult<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let rows = dedupe_last_wins(rows);
    ensure_areas(conn, &rows).await?;

    let codes = rows.iter().map(|r| r.area_code.clone()).collect::<Vec<_>>();
    let stamps = rows.iter().map(|r| r.timestamp).collect::<Vec<_>>();
    let temperatures = rows.iter().map(|r| r.temperature).collect::<Vec<_>>();
    let humidities = rows.iter().map(|r| r.humidity).collect::<Vec<_>>();
    let sources = rows.iter().map(|r| r.file_source.clone()).collect::<Vec<_>>();

    let result = sqlx::query(
        r#"
        INSERT INTO sensor_readings (area_id, recorded_at, temperature, humidity, file_source, updated_at)
        SELECT a.id, r.recorded_at, r.temperature, r.humidity, r.file_source, NOW()
          FROM UNNEST($1::text[], $2::timestamptz[], $3::numeric[], $4::numeric[], $5::text[])
               AS r(area_code, recorded_at, temperature, humidity, file_source)
          JOIN areas a ON a.code = r.area_code
        ON CONFLICT (area_id, recorded_at) DO UPDATE
           SET temperature = EXCLUDED.temperature,
               humidity = EXCLUDED.humidity,
               file_source = EXCLUDED.file_source,
               updated_at = NOW()
        "#,
    )
    .bind(&codes)
    .bind(&stamps)
    .bind(&temperatures)
    .bind(&humidities)
    .bind(&sources)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const TASK_COLUMNS: &str = "task_id, batch_id, file_name, status, records, skipped, imported, \
     duplicates, conflicts, anomalies_total, anomalies_processed, skip_count, overwrite_count, \
     auto_resolved, manual_resolved, error, created_at, progress_last_at";

fn task_from_row(row: &PgRow) -> StorageResult<ImportTask> {
    let status: String = row.try_get("status")?;
    Ok(ImportTask {
        task_id: row.try_get("task_id")?,
        batch_id: row.try_get("batch_id")?,
        file_name: row.try_get("file_name")?,
        status: TaskStatus::from_str(&status).map_err(StorageError::Corrupt)?,
        counters: TaskCounters {
            records: row.try_get("records")?,
            skipped: row.try_get("skipped")?,
            imported: row.try_get("imported")?,
            duplicates: row.try_get("duplicates")?,
            conflicts: row.try_get("conflicts")?,
            anomalies_total: row.try_get("anomalies_total")?,
            anomalies_processed: row.try_get("anomalies_processed")?,
            skip_count: row.try_get("skip_count")?,
            overwrite_count: row.try_get("overwrite_count")?,
            auto_resolved: row.try_get("auto_resolved")?,
            manual_resolved: row.try_get("manual_resolved")?,
        },
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        progress_last_at: row.try_get::<Option<DateTime<Utc>>, _>("progress_last_at")?,
    })
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert_task(&self, task: &ImportTask) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO import_tasks (task_id, batch_id, file_name, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(task.task_id)
        .bind(task.batch_id)
        .bind(&task.file_name)
        .bind(task.status.as_str())
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> StorageResult<Option<ImportTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM import_tasks WHERE task_id = $1");
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn save_task(&self, task: &ImportTask) -> StorageResult<()> {
        let c = &task.counters;
        let result = sqlx::query(
            r#"
            UPDATE import_tasks
               SET status = $2,
                   records = $3,
                   skipped = $4,
                   imported = $5,
                   duplicates = $6,
                   conflicts = $7,
                   anomalies_total = $8,
                   anomalies_processed = $9,
                   skip_count = $10,
                   overwrite_count = $11,
                   auto_resolved = $12,
                   manual_resolved = $13,
                   error = $14,
                   progress_last_at = $15
             WHERE task_id = $1
            "#,
        )
        .bind(task.task_id)
        .bind(task.status.as_str())
        .bind(c.records)
        .bind(c.skipped)
        .bind(c.imported)
        .bind(c.duplicates)
        .bind(c.conflicts)
        .bind(c.anomalies_total)
        .bind(c.anomalies_processed)
        .bind(c.skip_count)
        .bind(c.overwrite_count)
        .bind(c.auto_resolved)
        .bind(c.manual_resolved)
        .bind(&task.error)
        .bind(task.progress_last_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("task {}", task.task_id)));
        }
        Ok(())
    }

    async fn apply_tally(&self, tally: &ResolutionTally) -> StorageResult<()> {
        let (skips, overwrites) = match tally.action {
            ResolutionAction::Skip => (tally.resolved, 0),
            ResolutionAction::Overwrite => (0, tally.resolved),
        };
        let result = sqlx::query(
            r#"
            UPDATE import_tasks
               SET manual_resolved = manual_resolved + $2,
                   anomalies_processed = anomalies_processed + $2,
                   skip_count = skip_count + $3,
                   overwrite_count = overwrite_count + $4,
                   status = $5,
                   progress_last_at = $6
             WHERE task_id = $1
            "#,
        )
        .bind(tally.task_id)
        .bind(tally.resolved)
        .bind(skips)
        .bind(overwrites)
        .bind(tally.status.as_str())
        .bind(tally.at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("task {}", tally.task_id)));
        }
        Ok(())
    }

    async fn tasks_for_batch(&self, batch_id: Uuid) -> StorageResult<Vec<ImportTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM import_tasks WHERE batch_id = $1 ORDER BY created_at, file_name"
        );
        let rows = sqlx::query(&sql)
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn delete_batch_tasks(&self, batch_id: Uuid) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM import_tasks WHERE batch_id = $1")
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
