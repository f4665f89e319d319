use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hygrolog_core::{
    Anomaly, AnomalyKind, AnomalyRecord, Clock, Resolution, ResolutionAction, SystemClock,
};
use hygrolog_storage::{SensorStore, StorageError, StorageResult};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::{
    build_overview, require_ids, validate_choice, validate_records, AnomalyClaim,
    AnomalyOverview, AnomalyStore, AnomalyTtl, ReadingWrites,
};

/// Process-local anomaly table.
///
/// Created once at startup and shared as `Arc<dyn AnomalyStore>`. A claim holds the table lock
/// until it commits or drops, so an anomaly cannot be resolved twice.
#[derive(Debug)]
pub struct MemoryAnomalyStore {
    ttl: AnomalyTtl,
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<HashMap<Uuid, Anomaly>>>,
}

impl MemoryAnomalyStore {
    pub fn new(ttl: AnomalyTtl) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: AnomalyTtl, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Rows held in memory, expired or not.
    pub async fn physical_len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

fn live(
    entries: &HashMap<Uuid, Anomaly>,
    id: Uuid,
    now: chrono::DateTime<chrono::Utc>,
) -> Option<&Anomaly> {
    entries.get(&id).filter(|a| !a.is_expired(now))
}

#[async_trait]
impl AnomalyStore for MemoryAnomalyStore {
    async fn register(
        &self,
        batch_id: Uuid,
        task_id: Uuid,
        records: Vec<AnomalyRecord>,
    ) -> StorageResult<Vec<Anomaly>> {
        validate_records(&records)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let mut registered = Vec::with_capacity(records.len());
        for record in records {
            let mut anomaly_id = record.anomaly_id;
            while entries.contains_key(&anomaly_id) {
                anomaly_id = Uuid::new_v4();
            }
            let anomaly = Anomaly {
                anomaly_id,
                batch_id,
                task_id,
                area_name: record.area_name,
                timestamp: record.timestamp,
                kind: record.kind,
                variants: record.variants,
                created_at: now,
                expires_at: self.ttl.expires_at(record.kind, now),
            };
            entries.insert(anomaly_id, anomaly.clone());
            registered.push(anomaly);
        }
        debug!(%batch_id, %task_id, count = registered.len(), "registered anomalies");
        Ok(registered)
    }

    async fn overview(&self) -> StorageResult<AnomalyOverview> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(build_overview(entries.values().filter(|a| !a.is_expired(now))))
    }

    async fn find_by_id(&self, anomaly_id: Uuid) -> StorageResult<Option<Anomaly>> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(live(&entries, anomaly_id, now).cloned())
    }

    async fn claim_one(
        &self,
        anomaly_id: Uuid,
        action: ResolutionAction,
        chosen_variant_id: Option<Uuid>,
    ) -> StorageResult<Box<dyn AnomalyClaim>> {
        let now = self.clock.now();
        let entries = self.entries.clone().lock_owned().await;
        let anomaly = live(&entries, anomaly_id, now)
            .ok_or_else(|| StorageError::NotFound(format!("anomaly {anomaly_id}")))?;
        validate_choice(anomaly, action, chosen_variant_id)?;
        let resolution = Resolution::from_anomaly(anomaly.clone(), action, chosen_variant_id);
        Ok(Box::new(MemoryClaim {
            entries,
            resolutions: vec![resolution],
        }))
    }

    async fn claim_bulk(
        &self,
        kind: AnomalyKind,
        action: ResolutionAction,
        anomaly_ids: &[Uuid],
    ) -> StorageResult<Box<dyn AnomalyClaim>> {
        require_ids(anomaly_ids)?;
        let now = self.clock.now();
        let entries = self.entries.clone().lock_owned().await;
        let mut resolutions: Vec<Resolution> = Vec::new();
        for id in anomaly_ids {
            let Some(anomaly) = live(&entries, *id, now).filter(|a| a.kind == kind) else {
                continue;
            };
            if resolutions.iter().any(|r| r.anomaly_id == *id) {
                continue;
            }
            resolutions.push(Resolution::from_anomaly(anomaly.clone(), action, None));
        }
        Ok(Box::new(MemoryClaim {
            entries,
            resolutions,
        }))
    }

    async fn pending_count_for_task(&self, task_id: Uuid) -> StorageResult<u64> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(entries
            .values()
            .filter(|a| a.task_id == task_id && !a.is_expired(now))
            .count() as u64)
    }

    async fn delete_batch(&self, batch_id: Uuid) -> StorageResult<u64> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, a| a.batch_id != batch_id);
        Ok((before - entries.len()) as u64)
    }

    async fn total_pending(&self) -> StorageResult<u64> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(entries.values().filter(|a| !a.is_expired(now)).count() as u64)
    }

    async fn purge_expired(&self) -> StorageResult<u64> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, a| !a.is_expired(now));
        Ok((before - entries.len()) as u64)
    }
}

struct MemoryClaim {
    entries: OwnedMutexGuard<HashMap<Uuid, Anomaly>>,
    resolutions: Vec<Resolution>,
}

#[async_trait]
impl AnomalyClaim for MemoryClaim {
    fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    async fn commit(&mut self, writes: Option<ReadingWrites<'_>>) -> StorageResult<Vec<Resolution>> {
        if let Some(writes) = writes {
            for chunk in writes.rows.chunks(writes.chunk_size.max(1)) {
                writes.sensors.upsert_readings(chunk).await?;
            }
        }
        let resolutions = std::mem::take(&mut self.resolutions);
        for resolution in &resolutions {
            self.entries.remove(&resolution.anomaly_id);
        }
        Ok(resolutions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use chrono::Duration;
    use hygrolog_core::ManualClock;

    fn store_at(hour: u32) -> (MemoryAnomalyStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(at(hour)));
        let store = MemoryAnomalyStore::with_clock(AnomalyTtl::default(), clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn registering_twice_yields_distinct_anomalies() {
        let (store, _clock) = store_at(0);
        let (batch, task) = (Uuid::new_v4(), Uuid::new_v4());
        let records = vec![duplicate("Lab", 1)];

        let first = store.register(batch, task, records.clone()).await.unwrap();
        let second = store.register(batch, task, records.clone()).await.unwrap();

        assert_eq!(first[0].anomaly_id, records[0].anomaly_id);
        assert_ne!(first[0].anomaly_id, second[0].anomaly_id);
        assert_eq!(store.total_pending().await.unwrap(), 2);
        assert_eq!(store.pending_count_for_task(task).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn resolving_twice_is_not_found() {
        let (store, _clock) = store_at(0);
        let registered = store
            .register(Uuid::new_v4(), Uuid::new_v4(), vec![conflict("Lab", 1)])
            .await
            .unwrap();
        let id = registered[0].anomaly_id;

        let resolution = store
            .resolve_one(id, ResolutionAction::Overwrite, None)
            .await
            .unwrap();
        assert_eq!(resolution.anomaly_id, id);
        assert!(resolution.chosen.is_some());

        let err = store
            .resolve_one(id, ResolutionAction::Overwrite, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_chosen_variant_is_rejected_without_consuming() {
        let (store, _clock) = store_at(0);
        let registered = store
            .register(Uuid::new_v4(), Uuid::new_v4(), vec![conflict("Lab", 1)])
            .await
            .unwrap();
        let anomaly = &registered[0];

        let err = store
            .resolve_one(anomaly.anomaly_id, ResolutionAction::Overwrite, Some(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRequest(_)));
        assert!(store.find_by_id(anomaly.anomaly_id).await.unwrap().is_some());

        let chosen = anomaly.variants[1].variant_id;
        let resolution = store
            .resolve_one(anomaly.anomaly_id, ResolutionAction::Overwrite, Some(chosen))
            .await
            .unwrap();
        assert_eq!(resolution.chosen.unwrap().variant_id, chosen);
    }

    #[tokio::test]
    async fn expired_duplicates_are_absent_everywhere() {
        let (store, clock) = store_at(0);
        let task = Uuid::new_v4();
        let registered = store
            .register(Uuid::new_v4(), task, vec![duplicate("Lab", 1), conflict("Lab", 2)])
            .await
            .unwrap();
        let dup_id = registered[0].anomaly_id;

        clock.advance(Duration::hours(24) + Duration::seconds(1));

        assert!(store.find_by_id(dup_id).await.unwrap().is_none());
        let overview = store.overview().await.unwrap();
        assert_eq!(overview.duplicates.pending_count, 0);
        assert_eq!(overview.conflicts.len(), 1);
        assert!(matches!(
            store.resolve_one(dup_id, ResolutionAction::Skip, None).await,
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(store.pending_count_for_task(task).await.unwrap(), 1);
        assert_eq!(store.physical_len().await, 2);

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.physical_len().await, 1);
        assert_eq!(store.total_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bulk_resolve_skips_mismatched_and_unknown_ids() {
        let (store, _clock) = store_at(0);
        let task = Uuid::new_v4();
        let registered = store
            .register(
                Uuid::new_v4(),
                task,
                vec![duplicate("Lab", 1), duplicate("Lab", 2), conflict("Lab", 3)],
            )
            .await
            .unwrap();
        let ids = registered
            .iter()
            .map(|a| a.anomaly_id)
            .chain(std::iter::once(Uuid::new_v4()))
            .collect::<Vec<_>>();

        let resolved = store
            .bulk_resolve(AnomalyKind::Duplicate, ResolutionAction::Skip, &ids)
            .await
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|r| r.chosen.as_ref().unwrap().existing_count > 0));
        assert_eq!(store.pending_count_for_task(task).await.unwrap(), 1);

        assert!(matches!(
            store
                .bulk_resolve(AnomalyKind::Conflict, ResolutionAction::Skip, &[])
                .await,
            Err(StorageError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn dropped_claim_leaves_anomaly_pending() {
        let (store, _clock) = store_at(0);
        let registered = store
            .register(Uuid::new_v4(), Uuid::new_v4(), vec![conflict("Lab", 1)])
            .await
            .unwrap();
        let id = registered[0].anomaly_id;

        let claim = store
            .claim_one(id, ResolutionAction::Overwrite, None)
            .await
            .unwrap();
        assert_eq!(claim.resolutions().len(), 1);
        drop(claim);
        assert!(store.find_by_id(id).await.unwrap().is_some());

        let mut claim = store
            .claim_one(id, ResolutionAction::Overwrite, None)
            .await
            .unwrap();
        assert_eq!(claim.commit(None).await.unwrap().len(), 1);
        assert!(claim.commit(None).await.unwrap().is_empty());
        drop(claim);
        assert!(store.find_by_id(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_batch_only_touches_that_batch() {
        let (store, _clock) = store_at(0);
        let (keep, purged) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .register(keep, Uuid::new_v4(), vec![duplicate("Lab", 1)])
            .await
            .unwrap();
        store
            .register(purged, Uuid::new_v4(), vec![duplicate("Lab", 1), conflict("Lab", 2)])
            .await
            .unwrap();

        assert_eq!(store.delete_batch(purged).await.unwrap(), 2);
        assert_eq!(store.total_pending().await.unwrap(), 1);
    }
}
