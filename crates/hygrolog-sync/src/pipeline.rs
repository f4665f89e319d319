//! Batch import: one task per file, reconciliation, auto-merge upserts and anomaly registration.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hygrolog_anomaly::AnomalyStore;
use hygrolog_core::{Clock, ImportTask, ParsedReading, ReadingKey, TaskCounters, TaskStatus};
use hygrolog_storage::{SensorStore, TaskStore};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::reconcile;

/// Upload document accepted by the `import` command.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportDocument {
    #[serde(default)]
    pub batch_id: Option<Uuid>,
    pub files: Vec<ImportFileDocument>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportFileDocument {
    pub file_name: String,
    #[serde(default)]
    pub file_source: Option<String>,
    #[serde(default)]
    pub readings: Vec<ReadingDocument>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingDocument {
    pub area_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub temperature: Option<Decimal>,
    #[serde(default)]
    pub humidity: Option<Decimal>,
}

/// One file's rows, already normalized.
#[derive(Debug, Clone)]
pub struct ImportFile {
    pub file_name: String,
    pub readings: Vec<ParsedReading>,
}

impl From<ImportFileDocument> for ImportFile {
    fn from(doc: ImportFileDocument) -> Self {
        let source = doc.file_source.unwrap_or_else(|| doc.file_name.clone());
        let readings = doc
            .readings
            .into_iter()
            .map(|r| ParsedReading::parsed(&r.area_name, r.timestamp, r.temperature, r.humidity, &source))
            .collect();
        Self {
            file_name: doc.file_name,
            readings,
        }
    }
}

impl ImportDocument {
    /// Splits the document into the batch id to use and its files.
    pub fn into_batch(self) -> (Uuid, Vec<ImportFile>) {
        let batch_id = self.batch_id.unwrap_or_else(Uuid::new_v4);
        (batch_id, self.files.into_iter().map(ImportFile::from).collect())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileImportSummary {
    pub task_id: Uuid,
    pub file_name: String,
    pub status: TaskStatus,
    pub counters: TaskCounters,
    pub pending_anomalies: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<FileImportSummary>,
}

impl BatchSummary {
    pub fn failed_files(&self) -> impl Iterator<Item = &FileImportSummary> {
        self.files.iter().filter(|f| f.status == TaskStatus::Failed)
    }

    pub fn is_partial_failure(&self) -> bool {
        self.failed_files().next().is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDeletion {
    pub batch_id: Uuid,
    pub tasks_deleted: u64,
    pub anomalies_deleted: u64,
}

#[derive(Clone)]
pub struct ImportPipeline {
    sensors: Arc<dyn SensorStore>,
    tasks: Arc<dyn TaskStore>,
    anomalies: Arc<dyn AnomalyStore>,
    clock: Arc<dyn Clock>,
    upsert_chunk_size: usize,
}

impl ImportPipeline {
    pub fn new(
        sensors: Arc<dyn SensorStore>,
        tasks: Arc<dyn TaskStore>,
        anomalies: Arc<dyn AnomalyStore>,
        clock: Arc<dyn Clock>,
        upsert_chunk_size: usize,
    ) -> Self {
        Self {
            sensors,
            tasks,
            anomalies,
            clock,
            upsert_chunk_size: upsert_chunk_size.max(1),
        }
    }

    /// Imports every file of a batch. A failing file marks only its own task failed.
    pub async fn run_batch(&self, batch_id: Uuid, files: Vec<ImportFile>) -> Result<BatchSummary> {
        let started_at = self.clock.now();
        let mut summaries = Vec::with_capacity(files.len());

        for file in files {
            let mut task = ImportTask::new(batch_id, &file.file_name, self.clock.now());
            self.tasks
                .insert_task(&task)
                .await
                .with_context(|| format!("creating task for {}", file.file_name))?;

            let span = info_span!("import_file", %batch_id, task_id = %task.task_id, file = %file.file_name);
            let pending = match self.import_file(&mut task, &file).instrument(span).await {
                Ok(pending) => pending,
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(%batch_id, task_id = %task.task_id, file = %file.file_name, error = %message, "file import failed");
                    task.status = TaskStatus::Failed;
                    task.error = Some(message);
                    task.progress_last_at = Some(self.clock.now());
                    if let Err(save_err) = self.tasks.save_task(&task).await {
                        warn!(task_id = %task.task_id, error = %save_err, "could not record task failure");
                    }
                    0
                }
            };

            summaries.push(FileImportSummary {
                task_id: task.task_id,
                file_name: task.file_name.clone(),
                status: task.status,
                counters: task.counters,
                pending_anomalies: pending,
                error: task.error.clone(),
            });
        }

        let summary = BatchSummary {
            batch_id,
            started_at,
            finished_at: self.clock.now(),
            files: summaries,
        };
        info!(
            %batch_id,
            files = summary.files.len(),
            failed = summary.failed_files().count(),
            "batch import finished"
        );
        Ok(summary)
    }

    async fn import_file(&self, task: &mut ImportTask, file: &ImportFile) -> Result<u64> {
        task.status = TaskStatus::Processing;
        self.tasks.save_task(task).await.context("marking task processing")?;

        let (valid, blank): (Vec<ParsedReading>, Vec<ParsedReading>) = file
            .readings
            .iter()
            .cloned()
            .partition(|r| r.has_values() && !r.area_code.is_empty());

        let keys = valid
            .iter()
            .map(ParsedReading::key)
            .collect::<BTreeSet<ReadingKey>>()
            .into_iter()
            .collect::<Vec<_>>();
        let existing = self
            .sensors
            .existing_readings(&keys)
            .await
            .context("loading existing readings")?;

        let outcome = reconcile(&valid, &existing);
        for chunk in outcome.resolved.chunks(self.upsert_chunk_size) {
            self.sensors
                .upsert_readings(chunk)
                .await
                .context("writing auto-merged readings")?;
        }

        let registered = self
            .anomalies
            .register(task.batch_id, task.task_id, outcome.anomalies)
            .await
            .context("registering anomalies")?;
        let pending = self
            .anomalies
            .pending_count_for_task(task.task_id)
            .await
            .context("counting pending anomalies")?;

        let imported = outcome.resolved.len() as i64;
        task.counters = TaskCounters {
            records: file.readings.len() as i64,
            skipped: blank.len() as i64,
            imported,
            duplicates: outcome.duplicate_count as i64,
            conflicts: outcome.conflict_count as i64,
            anomalies_total: registered.len() as i64,
            auto_resolved: imported,
            ..TaskCounters::default()
        };
        task.status = TaskStatus::from_pending(pending);
        task.progress_last_at = Some(self.clock.now());
        self.tasks.save_task(task).await.context("saving task counters")?;

        info!(
            records = task.counters.records,
            imported,
            anomalies = registered.len(),
            status = task.status.as_str(),
            "file imported"
        );
        Ok(pending)
    }

    /// Removes a batch's tasks and every anomaly registered under it.
    pub async fn delete_batch(&self, batch_id: Uuid) -> Result<BatchDeletion> {
        let anomalies_deleted = self
            .anomalies
            .delete_batch(batch_id)
            .await
            .context("deleting batch anomalies")?;
        let tasks_deleted = self
            .tasks
            .delete_batch_tasks(batch_id)
            .await
            .context("deleting batch tasks")?;
        info!(%batch_id, tasks_deleted, anomalies_deleted, "batch deleted");
        Ok(BatchDeletion {
            batch_id,
            tasks_deleted,
            anomalies_deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_defaults_source_to_file_name() {
        let raw = r#"{
            "files": [{
                "fileName": "march.xlsx",
                "readings": [
                    {"areaName": "cold  room", "timestamp": "2026-03-01T08:00:00Z", "temperature": "4.567"},
                    {"areaName": "Cold Room", "timestamp": "2026-03-01T09:00:00Z", "humidity": 55}
                ]
            }]
        }"#;
        let doc: ImportDocument = serde_json::from_str(raw).unwrap();
        let (batch_id, files) = doc.into_batch();

        assert!(!batch_id.is_nil());
        let readings = &files[0].readings;
        assert_eq!(readings[0].area_code, "COLD_ROOM");
        assert_eq!(readings[0].file_source, "march.xlsx");
        assert_eq!(readings[0].temperature, Some("4.57".parse().unwrap()));
        assert_eq!(readings[1].humidity, Some(Decimal::from(55)));
        assert_eq!(readings[1].temperature, None);
    }

    #[test]
    fn explicit_batch_id_and_source_are_kept() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"batchId":"{id}","files":[{{"fileName":"a.xlsx","fileSource":"/uploads/2026/a.xlsx"}}]}}"#
        );
        let doc: ImportDocument = serde_json::from_str(&raw).unwrap();
        let (batch_id, files) = doc.into_batch();
        assert_eq!(batch_id, id);
        assert!(files[0].readings.is_empty());
    }
}
