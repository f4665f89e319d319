//! Anomaly store contract and its in-process and PostgreSQL-backed implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use hygrolog_core::{
    Anomaly, AnomalyKind, AnomalyRecord, Resolution, ResolutionAction, VariantAggregate,
};
use hygrolog_storage::{SensorStore, SensorUpsert, StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryAnomalyStore;
pub use postgres::PgAnomalyStore;

pub const CRATE_NAME: &str = "hygrolog-anomaly";

pub const PENDING_STATUS: &str = "pending";

/// How long each anomaly type stays resolvable; `None` means it never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyTtl {
    pub duplicate: Option<Duration>,
    pub conflict: Option<Duration>,
}

impl Default for AnomalyTtl {
    fn default() -> Self {
        Self {
            duplicate: Some(Duration::hours(24)),
            conflict: None,
        }
    }
}

impl AnomalyTtl {
    pub fn expires_at(&self, kind: AnomalyKind, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = match kind {
            AnomalyKind::Duplicate => self.duplicate,
            AnomalyKind::Conflict => self.conflict,
        };
        ttl.map(|ttl| created_at + ttl)
    }
}

#[async_trait]
pub trait AnomalyStore: Send + Sync {
    /// Appends anomalies for one task. A record whose id is already pending gets a fresh id.
    async fn register(
        &self,
        batch_id: Uuid,
        task_id: Uuid,
        records: Vec<AnomalyRecord>,
    ) -> StorageResult<Vec<Anomaly>>;

    async fn overview(&self) -> StorageResult<AnomalyOverview>;

    async fn find_by_id(&self, anomaly_id: Uuid) -> StorageResult<Option<Anomaly>>;

    /// Locks one live anomaly for consumption. Unknown or expired ids are `NotFound`; an
    /// explicitly chosen variant that the anomaly does not carry is `InvalidRequest`.
    async fn claim_one(
        &self,
        anomaly_id: Uuid,
        action: ResolutionAction,
        chosen_variant_id: Option<Uuid>,
    ) -> StorageResult<Box<dyn AnomalyClaim>>;

    /// Locks every listed live anomaly of the given type; other ids are skipped silently.
    async fn claim_bulk(
        &self,
        kind: AnomalyKind,
        action: ResolutionAction,
        anomaly_ids: &[Uuid],
    ) -> StorageResult<Box<dyn AnomalyClaim>>;

    /// Consumes one anomaly without writing any readings.
    async fn resolve_one(
        &self,
        anomaly_id: Uuid,
        action: ResolutionAction,
        chosen_variant_id: Option<Uuid>,
    ) -> StorageResult<Resolution> {
        let mut claim = self.claim_one(anomaly_id, action, chosen_variant_id).await?;
        claim
            .commit(None)
            .await?
            .pop()
            .ok_or_else(|| StorageError::NotFound(format!("anomaly {anomaly_id}")))
    }

    /// Consumes every listed anomaly of the given type without writing any readings.
    async fn bulk_resolve(
        &self,
        kind: AnomalyKind,
        action: ResolutionAction,
        anomaly_ids: &[Uuid],
    ) -> StorageResult<Vec<Resolution>> {
        let mut claim = self.claim_bulk(kind, action, anomaly_ids).await?;
        claim.commit(None).await
    }

    async fn pending_count_for_task(&self, task_id: Uuid) -> StorageResult<u64>;

    async fn delete_batch(&self, batch_id: Uuid) -> StorageResult<u64>;

    async fn total_pending(&self) -> StorageResult<u64>;

    /// Physically drops expired rows. Resolves nothing.
    async fn purge_expired(&self) -> StorageResult<u64>;
}

/// Readings to write as part of committing a claim.
#[derive(Clone, Copy)]
pub struct ReadingWrites<'a> {
    pub sensors: &'a dyn SensorStore,
    pub rows: &'a [SensorUpsert],
    pub chunk_size: usize,
}

/// Anomalies held for consumption.
///
/// Nothing is consumed until `commit` succeeds. Dropping an uncommitted claim, or a failed
/// commit, leaves every anomaly pending.
#[async_trait]
pub trait AnomalyClaim: Send {
    fn resolutions(&self) -> &[Resolution];

    /// Writes `writes` (if any) and consumes the claimed anomalies as one unit. Returns the
    /// consumed resolutions; a second commit returns nothing.
    async fn commit(&mut self, writes: Option<ReadingWrites<'_>>) -> StorageResult<Vec<Resolution>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyOverview {
    pub duplicates: DuplicateSummary,
    pub conflicts: Vec<ConflictGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateSummary {
    pub pending_count: u64,
    pub record_count: u64,
    pub anomaly_ids: Vec<Uuid>,
    pub area_summaries: Vec<AreaSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaSummary {
    pub area_name: String,
    pub anomaly_count: u64,
    pub record_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictGroup {
    pub area_name: String,
    pub anomalies: Vec<ConflictEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub anomaly_id: Uuid,
    pub timestamp: String,
    pub status: String,
    pub variants: Vec<VariantAggregate>,
}

/// Builds the overview from live anomalies. Callers filter out expired entries first.
pub fn build_overview<'a>(anomalies: impl IntoIterator<Item = &'a Anomaly>) -> AnomalyOverview {
    let mut live = anomalies.into_iter().collect::<Vec<_>>();
    live.sort_by(|a, b| {
        a.area_name
            .cmp(&b.area_name)
            .then(a.timestamp.cmp(&b.timestamp))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.anomaly_id.cmp(&b.anomaly_id))
    });

    let mut duplicates = DuplicateSummary::default();
    let mut per_area: BTreeMap<&str, AreaSummary> = BTreeMap::new();
    let mut conflicts: BTreeMap<&str, Vec<ConflictEntry>> = BTreeMap::new();

    for anomaly in live {
        match anomaly.kind {
            AnomalyKind::Duplicate => {
                let records = anomaly.new_record_count();
                duplicates.pending_count += 1;
                duplicates.record_count += records;
                duplicates.anomaly_ids.push(anomaly.anomaly_id);
                let area = per_area
                    .entry(anomaly.area_name.as_str())
                    .or_insert_with(|| AreaSummary {
                        area_name: anomaly.area_name.clone(),
                        anomaly_count: 0,
                        record_count: 0,
                    });
                area.anomaly_count += 1;
                area.record_count += records;
            }
            AnomalyKind::Conflict => {
                conflicts
                    .entry(anomaly.area_name.as_str())
                    .or_default()
                    .push(ConflictEntry {
                        anomaly_id: anomaly.anomaly_id,
                        timestamp: anomaly.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                        status: PENDING_STATUS.to_string(),
                        variants: anomaly.variants.clone(),
                    });
            }
        }
    }

    duplicates.area_summaries = per_area.into_values().collect();
    AnomalyOverview {
        duplicates,
        conflicts: conflicts
            .into_iter()
            .map(|(area_name, anomalies)| ConflictGroup {
                area_name: area_name.to_string(),
                anomalies,
            })
            .collect(),
    }
}

/// Rejects records that break the duplicate-has-one / conflict-has-many variant rule.
pub fn validate_records(records: &[AnomalyRecord]) -> StorageResult<()> {
    for record in records {
        let ok = match record.kind {
            AnomalyKind::Duplicate => record.variants.len() == 1,
            AnomalyKind::Conflict => record.variants.len() >= 2,
        };
        if !ok {
            return Err(StorageError::InvalidRequest(format!(
                "{} anomaly {} carries {} variants",
                record.kind,
                record.anomaly_id,
                record.variants.len()
            )));
        }
    }
    Ok(())
}

/// An explicitly chosen variant must belong to the anomaly being overwritten.
pub fn validate_choice(
    anomaly: &Anomaly,
    action: ResolutionAction,
    chosen_variant_id: Option<Uuid>,
) -> StorageResult<()> {
    match (action, chosen_variant_id) {
        (ResolutionAction::Overwrite, Some(id)) if !anomaly.has_variant(id) => {
            Err(StorageError::InvalidRequest(format!(
                "variant {id} is not part of anomaly {}",
                anomaly.anomaly_id
            )))
        }
        _ => Ok(()),
    }
}

pub fn require_ids(anomaly_ids: &[Uuid]) -> StorageResult<()> {
    if anomaly_ids.is_empty() {
        return Err(StorageError::InvalidRequest(
            "bulk resolve needs at least one anomaly id".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;
    use hygrolog_core::{SourceKind, SourceSummary, EXISTING_SOURCE_LABEL};

    pub fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    pub fn variant(temp: &str, new_count: u32, existing_count: u32) -> VariantAggregate {
        let mut source_summaries = Vec::new();
        if new_count > 0 {
            source_summaries.push(SourceSummary {
                label: "march.xlsx".into(),
                count: new_count,
                kind: SourceKind::New,
            });
        }
        if existing_count > 0 {
            source_summaries.push(SourceSummary {
                label: EXISTING_SOURCE_LABEL.into(),
                count: existing_count,
                kind: SourceKind::Existing,
            });
        }
        VariantAggregate {
            variant_id: Uuid::new_v4(),
            temperature: Some(temp.parse().unwrap()),
            humidity: Some("50.00".parse().unwrap()),
            total_count: new_count + existing_count,
            new_count,
            existing_count,
            source_summaries,
        }
    }

    pub fn duplicate(area: &str, hour: u32) -> AnomalyRecord {
        AnomalyRecord {
            anomaly_id: Uuid::new_v4(),
            area_name: area.into(),
            timestamp: at(hour),
            kind: AnomalyKind::Duplicate,
            variants: vec![variant("22.00", 1, 1)],
        }
    }

    pub fn conflict(area: &str, hour: u32) -> AnomalyRecord {
        AnomalyRecord {
            anomaly_id: Uuid::new_v4(),
            area_name: area.into(),
            timestamp: at(hour),
            kind: AnomalyKind::Conflict,
            variants: vec![variant("22.00", 1, 0), variant("21.50", 1, 0)],
        }
    }
}
