//! Reconciliation, import orchestration and manual resolution for Hygrolog.

mod pipeline;
mod reconcile;
mod resolution;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Duration;
use hygrolog_anomaly::{AnomalyStore, AnomalyTtl, MemoryAnomalyStore, PgAnomalyStore};
use hygrolog_core::{Clock, SystemClock};
use hygrolog_storage::{
    MemorySensorStore, MemoryTaskStore, PgSensorStore, PgTaskStore, SensorStore, TaskStore,
    MAX_ROWS_PER_STATEMENT,
};
use sqlx::PgPool;
use tracing::info;

pub use pipeline::{
    BatchDeletion, BatchSummary, FileImportSummary, ImportDocument, ImportFile,
    ImportFileDocument, ImportPipeline, ReadingDocument,
};
pub use reconcile::{
    bucket_variants, build_aggregate, joined_labels, reconcile, ReconcileOutcome, VariantBucket,
};
pub use resolution::{
    BulkResolveRequest, ResolutionApplier, ResolutionService, ResolveRequest,
    TaskProgressTracker, MANUAL_RESOLUTION_SOURCE,
};

pub const CRATE_NAME: &str = "hygrolog-sync";

const DEFAULT_DUPLICATE_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyBackend {
    Memory,
    Postgres,
}

impl fmt::Display for AnomalyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AnomalyBackend::Memory => "memory",
            AnomalyBackend::Postgres => "postgres",
        })
    }
}

impl FromStr for AnomalyBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-process" => Ok(AnomalyBackend::Memory),
            "postgres" | "shared" => Ok(AnomalyBackend::Postgres),
            other => Err(format!("unknown anomaly backend `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HygrologConfig {
    /// Without a URL every store is kept in process memory.
    pub database_url: Option<String>,
    /// Follows `database_url` unless set explicitly; anomalies live wherever the readings do.
    pub anomaly_backend: AnomalyBackend,
    pub anomaly_ttl: AnomalyTtl,
    pub upsert_chunk_size: usize,
}

impl Default for HygrologConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            anomaly_backend: AnomalyBackend::Memory,
            anomaly_ttl: AnomalyTtl::default(),
            upsert_chunk_size: MAX_ROWS_PER_STATEMENT,
        }
    }
}

impl HygrologConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        let fallback_backend = if database_url.is_some() {
            AnomalyBackend::Postgres
        } else {
            AnomalyBackend::Memory
        };
        Self {
            anomaly_backend: lookup("HYGROLOG_ANOMALY_BACKEND")
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback_backend),
            database_url,
            anomaly_ttl: AnomalyTtl {
                duplicate: ttl_from(lookup("HYGROLOG_DUPLICATE_TTL_SECS"), DEFAULT_DUPLICATE_TTL_SECS),
                conflict: ttl_from(lookup("HYGROLOG_CONFLICT_TTL_SECS"), 0),
            },
            upsert_chunk_size: lookup("HYGROLOG_UPSERT_CHUNK_SIZE")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(MAX_ROWS_PER_STATEMENT),
        }
    }

    /// Rejects backend choices that cannot keep anomalies next to the readings they describe.
    pub fn validate(&self) -> Result<()> {
        match (self.anomaly_backend, self.database_url.is_some()) {
            (AnomalyBackend::Postgres, false) => {
                bail!("the postgres anomaly backend requires DATABASE_URL")
            }
            (AnomalyBackend::Memory, true) => bail!(
                "in-memory anomalies would be lost on exit while readings persist; \
                 unset HYGROLOG_ANOMALY_BACKEND or set it to postgres"
            ),
            _ => Ok(()),
        }
    }
}

/// Seconds from the environment, where zero means "never expires".
fn ttl_from(raw: Option<String>, default_secs: i64) -> Option<Duration> {
    let secs = raw
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default_secs);
    (secs > 0).then(|| Duration::seconds(secs))
}

/// Every store and service wired from one configuration.
#[derive(Clone)]
pub struct Services {
    pub pool: Option<PgPool>,
    pub anomalies: Arc<dyn AnomalyStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub pipeline: ImportPipeline,
    pub resolutions: ResolutionService,
}

impl Services {
    pub async fn connect(config: &HygrologConfig) -> Result<Self> {
        config.validate()?;
        let pool = match &config.database_url {
            Some(url) => Some(
                hygrolog_storage::connect(url)
                    .await
                    .context("connecting to DATABASE_URL")?,
            ),
            None => None,
        };
        Self::build(config, pool, Arc::new(SystemClock))
    }

    /// Wires stores onto an optional pool. Anomalies use the pool exactly when the readings do.
    pub fn build(
        config: &HygrologConfig,
        pool: Option<PgPool>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (sensors, tasks): (Arc<dyn SensorStore>, Arc<dyn TaskStore>) = match &pool {
            Some(pool) => (
                Arc::new(PgSensorStore::new(pool.clone())),
                Arc::new(PgTaskStore::new(pool.clone())),
            ),
            None => (
                Arc::new(MemorySensorStore::new()),
                Arc::new(MemoryTaskStore::new()),
            ),
        };
        let anomalies: Arc<dyn AnomalyStore> = match (config.anomaly_backend, &pool) {
            (AnomalyBackend::Memory, None) => Arc::new(MemoryAnomalyStore::with_clock(
                config.anomaly_ttl,
                clock.clone(),
            )),
            (AnomalyBackend::Postgres, Some(pool)) => Arc::new(PgAnomalyStore::with_clock(
                pool.clone(),
                config.anomaly_ttl,
                clock.clone(),
            )),
            (AnomalyBackend::Postgres, None) => {
                bail!("the postgres anomaly backend requires DATABASE_URL")
            }
            (AnomalyBackend::Memory, Some(_)) => {
                bail!("in-memory anomalies cannot be paired with a database pool")
            }
        };
        info!(
            backend = %config.anomaly_backend,
            persistent = pool.is_some(),
            chunk_size = config.upsert_chunk_size,
            "services configured"
        );

        Ok(Self::from_stores(
            pool,
            sensors,
            tasks,
            anomalies,
            clock,
            config.upsert_chunk_size,
        ))
    }

    pub fn from_stores(
        pool: Option<PgPool>,
        sensors: Arc<dyn SensorStore>,
        tasks: Arc<dyn TaskStore>,
        anomalies: Arc<dyn AnomalyStore>,
        clock: Arc<dyn Clock>,
        upsert_chunk_size: usize,
    ) -> Self {
        let pipeline = ImportPipeline::new(
            sensors.clone(),
            tasks.clone(),
            anomalies.clone(),
            clock.clone(),
            upsert_chunk_size,
        );
        let resolutions = ResolutionService::new(
            anomalies.clone(),
            ResolutionApplier::new(sensors, upsert_chunk_size),
            TaskProgressTracker::new(tasks.clone(), anomalies.clone(), clock),
        );
        Self {
            pool,
            anomalies,
            tasks,
            pipeline,
            resolutions,
        }
    }
}
