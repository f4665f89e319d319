//! Applying consumed anomalies to the sensor store and rolling them into task progress.

use std::collections::BTreeMap;
use std::sync::Arc;

use hygrolog_anomaly::{AnomalyClaim, AnomalyStore, ReadingWrites};
use hygrolog_core::{
    normalize_area_code, AnomalyKind, Clock, Resolution, ResolutionAction, ResolutionTally,
    TaskStatus,
};
use hygrolog_storage::{SensorStore, SensorUpsert, StorageError, StorageResult, TaskStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `file_source` written when an overwrite variant carries no upload labels.
pub const MANUAL_RESOLUTION_SOURCE: &str = "manual-resolution";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub action: ResolutionAction,
    #[serde(default)]
    pub variant_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResolveRequest {
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub action: ResolutionAction,
    pub anomaly_ids: Vec<Uuid>,
}

/// Turns overwrite resolutions into keyed upserts; skips leave the store untouched.
#[derive(Clone)]
pub struct ResolutionApplier {
    sensors: Arc<dyn SensorStore>,
    chunk_size: usize,
}

impl ResolutionApplier {
    pub fn new(sensors: Arc<dyn SensorStore>, chunk_size: usize) -> Self {
        Self {
            sensors,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn upserts_for(resolutions: &[Resolution]) -> Vec<SensorUpsert> {
        resolutions
            .iter()
            .filter(|r| r.action == ResolutionAction::Overwrite)
            .filter_map(|r| {
                let chosen = r.chosen.as_ref()?;
                let labels = chosen.new_source_labels();
                let file_source = if labels.is_empty() {
                    MANUAL_RESOLUTION_SOURCE.to_string()
                } else {
                    labels.join(", ")
                };
                Some(SensorUpsert {
                    area_code: normalize_area_code(&r.area_name),
                    area_name: r.area_name.clone(),
                    timestamp: r.timestamp,
                    temperature: chosen.temperature,
                    humidity: chosen.humidity,
                    file_source,
                })
            })
            .collect()
    }

    /// Commits a claim together with its overwrites, written in chunks of at most
    /// `chunk_size` rows. If the writes fail nothing is consumed.
    pub async fn commit(&self, claim: &mut dyn AnomalyClaim) -> StorageResult<Vec<Resolution>> {
        let upserts = Self::upserts_for(claim.resolutions());
        let writes = ReadingWrites {
            sensors: self.sensors.as_ref(),
            rows: &upserts,
            chunk_size: self.chunk_size,
        };
        let resolutions = claim.commit(Some(writes)).await?;
        debug!(resolutions = resolutions.len(), written = upserts.len(), "applied resolutions");
        Ok(resolutions)
    }
}

/// Rolls resolutions up per task so each touched task gets exactly one counter write.
#[derive(Clone)]
pub struct TaskProgressTracker {
    tasks: Arc<dyn TaskStore>,
    anomalies: Arc<dyn AnomalyStore>,
    clock: Arc<dyn Clock>,
}

impl TaskProgressTracker {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        anomalies: Arc<dyn AnomalyStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tasks,
            anomalies,
            clock,
        }
    }

    pub async fn record(&self, resolutions: &[Resolution]) -> StorageResult<Vec<ResolutionTally>> {
        let mut grouped: BTreeMap<(Uuid, ResolutionAction), i64> = BTreeMap::new();
        for resolution in resolutions {
            *grouped
                .entry((resolution.task_id, resolution.action))
                .or_default() += 1;
        }

        let mut tallies = Vec::with_capacity(grouped.len());
        for ((task_id, action), resolved) in grouped {
            let pending = self.anomalies.pending_count_for_task(task_id).await?;
            let tally = ResolutionTally {
                task_id,
                action,
                resolved,
                status: TaskStatus::from_pending(pending),
                at: self.clock.now(),
            };
            match self.tasks.apply_tally(&tally).await {
                Ok(()) => tallies.push(tally),
                Err(StorageError::NotFound(_)) => {
                    warn!(%task_id, "resolved anomalies for a task that no longer exists");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(tallies)
    }
}

/// Claim, write and consume as one unit, then track. The single entry point for manual resolution.
#[derive(Clone)]
pub struct ResolutionService {
    anomalies: Arc<dyn AnomalyStore>,
    applier: ResolutionApplier,
    tracker: TaskProgressTracker,
}

impl ResolutionService {
    pub fn new(
        anomalies: Arc<dyn AnomalyStore>,
        applier: ResolutionApplier,
        tracker: TaskProgressTracker,
    ) -> Self {
        Self {
            anomalies,
            applier,
            tracker,
        }
    }

    pub async fn resolve(
        &self,
        anomaly_id: Uuid,
        request: &ResolveRequest,
    ) -> StorageResult<Resolution> {
        let mut claim = self
            .anomalies
            .claim_one(anomaly_id, request.action, request.variant_id)
            .await?;
        let committed = self.applier.commit(claim.as_mut()).await;
        // The claim holds the anomaly lock; release it before counting what is left.
        drop(claim);
        let resolution = committed?
            .pop()
            .ok_or_else(|| StorageError::NotFound(format!("anomaly {anomaly_id}")))?;
        self.tracker.record(std::slice::from_ref(&resolution)).await?;
        info!(%anomaly_id, action = %request.action, "resolved anomaly");
        Ok(resolution)
    }

    pub async fn bulk_resolve(&self, request: &BulkResolveRequest) -> StorageResult<Vec<Resolution>> {
        let mut claim = self
            .anomalies
            .claim_bulk(request.kind, request.action, &request.anomaly_ids)
            .await?;
        let committed = self.applier.commit(claim.as_mut()).await;
        drop(claim);
        let resolutions = committed?;
        if resolutions.is_empty() {
            return Ok(resolutions);
        }
        self.tracker.record(&resolutions).await?;
        info!(
            kind = %request.kind,
            action = %request.action,
            requested = request.anomaly_ids.len(),
            resolved = resolutions.len(),
            "bulk resolved anomalies"
        );
        Ok(resolutions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hygrolog_core::{SourceKind, SourceSummary, VariantAggregate};

    fn resolution(action: ResolutionAction, labels: &[&str]) -> Resolution {
        let source_summaries = labels
            .iter()
            .map(|label| SourceSummary {
                label: label.to_string(),
                count: 1,
                kind: SourceKind::New,
            })
            .collect::<Vec<_>>();
        Resolution {
            anomaly_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            area_name: "Cold Room 2".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap(),
            kind: AnomalyKind::Conflict,
            action,
            chosen: Some(VariantAggregate {
                variant_id: Uuid::new_v4(),
                temperature: Some("4.50".parse().unwrap()),
                humidity: None,
                total_count: labels.len() as u32,
                new_count: labels.len() as u32,
                existing_count: 0,
                source_summaries,
            }),
        }
    }

    #[test]
    fn overwrite_upsert_uses_normalized_code_and_labels() {
        let upserts =
            ResolutionApplier::upserts_for(&[resolution(ResolutionAction::Overwrite, &["a.xlsx", "b.xlsx"])]);
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].area_code, "COLD_ROOM_2");
        assert_eq!(upserts[0].file_source, "a.xlsx, b.xlsx");
        assert_eq!(upserts[0].humidity, None);
    }

    #[test]
    fn overwrite_without_labels_falls_back_to_manual_source() {
        let upserts = ResolutionApplier::upserts_for(&[resolution(ResolutionAction::Overwrite, &[])]);
        assert_eq!(upserts[0].file_source, MANUAL_RESOLUTION_SOURCE);
    }

    #[test]
    fn skips_produce_no_writes() {
        let upserts = ResolutionApplier::upserts_for(&[resolution(ResolutionAction::Skip, &["a.xlsx"])]);
        assert!(upserts.is_empty());
    }

    #[test]
    fn bulk_request_reads_wire_names() {
        let raw = r#"{"type":"duplicate","action":"skip","anomalyIds":[]}"#;
        let request: BulkResolveRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.kind, AnomalyKind::Duplicate);
        assert_eq!(request.action, ResolutionAction::Skip);

        let request: ResolveRequest = serde_json::from_str(r#"{"action":"overwrite"}"#).unwrap();
        assert_eq!(request.variant_id, None);
    }
}
