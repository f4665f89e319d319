use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hygrolog_core::{
    Anomaly, AnomalyKind, AnomalyRecord, Clock, Resolution, ResolutionAction, SystemClock,
    VariantAggregate,
};
use hygrolog_storage::{upsert_readings_on, StorageError, StorageResult};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::{
    build_overview, require_ids, validate_choice, validate_records, AnomalyClaim,
    AnomalyOverview, AnomalyStore, AnomalyTtl, ReadingWrites,
};

const ANOMALY_COLUMNS: &str =
    "anomaly_id, batch_id, task_id, kind, area_name, recorded_at, variants, created_at, expires_at";

/// Anomaly table shared by every worker that talks to the same database.
///
/// A claim deletes its rows inside an open transaction, so concurrent resolvers block on the
/// row locks and only one of them receives each anomaly. Committing the claim writes the
/// chosen readings through the same transaction.
#[derive(Debug, Clone)]
pub struct PgAnomalyStore {
    pool: PgPool,
    ttl: AnomalyTtl,
    clock: Arc<dyn Clock>,
}

impl PgAnomalyStore {
    pub fn new(pool: PgPool, ttl: AnomalyTtl) -> Self {
        Self::with_clock(pool, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, ttl: AnomalyTtl, clock: Arc<dyn Clock>) -> Self {
        Self { pool, ttl, clock }
    }
}

fn anomaly_from_row(row: &PgRow) -> StorageResult<Anomaly> {
    let kind: String = row.try_get("kind")?;
    let variants: Json<Vec<VariantAggregate>> = row.try_get("variants")?;
    Ok(Anomaly {
        anomaly_id: row.try_get("anomaly_id")?,
        batch_id: row.try_get("batch_id")?,
        task_id: row.try_get("task_id")?,
        area_name: row.try_get("area_name")?,
        timestamp: row.try_get("recorded_at")?,
        kind: AnomalyKind::from_str(&kind).map_err(StorageError::Corrupt)?,
        variants: variants.0,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get::<Option<DateTime<Utc>>, _>("expires_at")?,
    })
}

#[async_trait]
impl AnomalyStore for PgAnomalyStore {
    async fn register(
        &self,
        batch_id: Uuid,
        task_id: Uuid,
        records: Vec<AnomalyRecord>,
    ) -> StorageResult<Vec<Anomaly>> {
        validate_records(&records)?;
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let mut registered = Vec::with_capacity(records.len());

        for record in records {
            let mut anomaly = Anomaly {
                anomaly_id: record.anomaly_id,
                batch_id,
                task_id,
                area_name: record.area_name,
                timestamp: record.timestamp,
                kind: record.kind,
                variants: record.variants,
                created_at: now,
                expires_at: self.ttl.expires_at(record.kind, now),
            };
            loop {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO reconcile_anomalies
                        (anomaly_id, batch_id, task_id, kind, area_name, recorded_at, variants, created_at, expires_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (anomaly_id) DO NOTHING
                    "#,
                )
                .bind(anomaly.anomaly_id)
                .bind(anomaly.batch_id)
                .bind(anomaly.task_id)
                .bind(anomaly.kind.as_str())
                .bind(&anomaly.area_name)
                .bind(anomaly.timestamp)
                .bind(Json(&anomaly.variants))
                .bind(anomaly.created_at)
                .bind(anomaly.expires_at)
                .execute(&mut *tx)
                .await?;
                if inserted.rows_affected() == 1 {
                    break;
                }
                anomaly.anomaly_id = Uuid::new_v4();
            }
            registered.push(anomaly);
        }

        tx.commit().await?;
        debug!(%batch_id, %task_id, count = registered.len(), "registered anomalies");
        Ok(registered)
    }

    async fn overview(&self) -> StorageResult<AnomalyOverview> {
        let sql = format!(
            "SELECT {ANOMALY_COLUMNS} FROM reconcile_anomalies \
             WHERE expires_at IS NULL OR expires_at > $1"
        );
        let rows = sqlx::query(&sql)
            .bind(self.clock.now())
            .fetch_all(&self.pool)
            .await?;
        let anomalies = rows.iter().map(anomaly_from_row).collect::<StorageResult<Vec<_>>>()?;
        Ok(build_overview(&anomalies))
    }

    async fn find_by_id(&self, anomaly_id: Uuid) -> StorageResult<Option<Anomaly>> {
        let sql = format!(
            "SELECT {ANOMALY_COLUMNS} FROM reconcile_anomalies \
             WHERE anomaly_id = $1 AND (expires_at IS NULL OR expires_at > $2)"
        );
        let row = sqlx::query(&sql)
            .bind(anomaly_id)
            .bind(self.clock.now())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(anomaly_from_row).transpose()
    }

    async fn claim_one(
        &self,
        anomaly_id: Uuid,
        action: ResolutionAction,
        chosen_variant_id: Option<Uuid>,
    ) -> StorageResult<Box<dyn AnomalyClaim>> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT {ANOMALY_COLUMNS} FROM reconcile_anomalies \
             WHERE anomaly_id = $1 AND (expires_at IS NULL OR expires_at > $2) \
             FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(anomaly_id)
            .bind(self.clock.now())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("anomaly {anomaly_id}")))?;
        let anomaly = anomaly_from_row(&row)?;
        validate_choice(&anomaly, action, chosen_variant_id)?;

        sqlx::query("DELETE FROM reconcile_anomalies WHERE anomaly_id = $1")
            .bind(anomaly_id)
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgClaim {
            tx: Some(tx),
            resolutions: vec![Resolution::from_anomaly(anomaly, action, chosen_variant_id)],
        }))
    }

    async fn claim_bulk(
        &self,
        kind: AnomalyKind,
        action: ResolutionAction,
        anomaly_ids: &[Uuid],
    ) -> StorageResult<Box<dyn AnomalyClaim>> {
        require_ids(anomaly_ids)?;
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "DELETE FROM reconcile_anomalies \
             WHERE anomaly_id = ANY($1) AND kind = $2 \
               AND (expires_at IS NULL OR expires_at > $3) \
             RETURNING {ANOMALY_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(anomaly_ids)
            .bind(kind.as_str())
            .bind(self.clock.now())
            .fetch_all(&mut *tx)
            .await?;

        let mut consumed = rows
            .iter()
            .map(|row| anomaly_from_row(row).map(|a| (a.anomaly_id, a)))
            .collect::<StorageResult<HashMap<_, _>>>()?;
        // Keep the caller's ordering.
        let resolutions = anomaly_ids
            .iter()
            .filter_map(|id| consumed.remove(id))
            .map(|anomaly| Resolution::from_anomaly(anomaly, action, None))
            .collect();
        Ok(Box::new(PgClaim {
            tx: Some(tx),
            resolutions,
        }))
    }

    async fn pending_count_for_task(&self, task_id: Uuid) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM reconcile_anomalies
             WHERE task_id = $1
               AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(task_id)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_batch(&self, batch_id: Uuid) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM reconcile_anomalies WHERE batch_id = $1")
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn total_pending(&self) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM reconcile_anomalies WHERE expires_at IS NULL OR expires_at > $1",
        )
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn purge_expired(&self) -> StorageResult<u64> {
        let result = sqlx::query(
            "DELETE FROM reconcile_anomalies WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Deleted rows whose transaction is still open; dropping it rolls the delete back.
struct PgClaim {
    tx: Option<Transaction<'static, Postgres>>,
    resolutions: Vec<Resolution>,
}

#[async_trait]
impl AnomalyClaim for PgClaim {
    fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    /// `writes.sensors` is not used: the rows go through this claim's own transaction, which
    /// assumes the readings live in the same database.
    async fn commit(&mut self, writes: Option<ReadingWrites<'_>>) -> StorageResult<Vec<Resolution>> {
        let Some(mut tx) = self.tx.take() else {
            return Ok(Vec::new());
        };
        if let Some(writes) = writes {
            for chunk in writes.rows.chunks(writes.chunk_size.max(1)) {
                upsert_readings_on(&mut *tx, chunk).await?;
            }
        }
        tx.commit().await?;
        debug!(count = self.resolutions.len(), "committed anomaly claim");
        Ok(std::mem::take(&mut self.resolutions))
    }
}
