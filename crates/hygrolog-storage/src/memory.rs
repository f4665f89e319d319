use std::collections::HashMap;

use async_trait::async_trait;
use hygrolog_core::{ImportTask, ParsedReading, ReadingKey, ResolutionAction, ResolutionTally};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    dedupe_last_wins, SensorStore, SensorUpsert, StorageError, StorageResult, TaskStore,
};

#[derive(Debug, Default)]
struct SensorState {
    rows: HashMap<ReadingKey, SensorUpsert>,
    upsert_statements: u64,
}

/// Process-local sensor table, used by tests and by dry runs without a database.
#[derive(Debug, Default)]
pub struct MemorySensorStore {
    state: Mutex<SensorState>,
}

impl MemorySensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a row without counting it as an upsert statement.
    pub async fn seed(&self, row: SensorUpsert) {
        let mut state = self.state.lock().await;
        state.rows.insert(row.key(), row);
    }

    pub async fn get(&self, key: &ReadingKey) -> Option<SensorUpsert> {
        self.state.lock().await.rows.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn upsert_statements(&self) -> u64 {
        self.state.lock().await.upsert_statements
    }
}

#[async_trait]
impl SensorStore for MemorySensorStore {
    async fn existing_readings(&self, keys: &[ReadingKey]) -> StorageResult<Vec<ParsedReading>> {
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| state.rows.get(key))
            .map(|row| ParsedReading {
                area_code: row.area_code.clone(),
                area_name: row.area_name.clone(),
                timestamp: row.timestamp,
                temperature: row.temperature,
                humidity: row.humidity,
                file_source: row.file_source.clone(),
                is_existing: true,
            })
            .collect())
    }

    async fn upsert_readings(&self, rows: &[SensorUpsert]) -> StorageResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let rows = dedupe_last_wins(rows);
        let mut state = self.state.lock().await;
        state.upsert_statements += 1;
        let written = rows.len() as u64;
        for row in rows {
            state.rows.insert(row.key(), row);
        }
        Ok(written)
    }
}

#[derive(Debug, Default)]
struct TaskState {
    tasks: HashMap<Uuid, ImportTask>,
    writes: HashMap<Uuid, u64>,
}

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    state: Mutex<TaskState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes the task row received after insertion.
    pub async fn write_count(&self, task_id: Uuid) -> u64 {
        self.state
            .lock()
            .await
            .writes
            .get(&task_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_task(&self, task: &ImportTask) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.task_id) {
            return Err(StorageError::InvalidRequest(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        state.tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> StorageResult<Option<ImportTask>> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn save_task(&self, task: &ImportTask) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(&task.task_id) {
            return Err(StorageError::NotFound(format!("task {}", task.task_id)));
        }
        state.tasks.insert(task.task_id, task.clone());
        *state.writes.entry(task.task_id).or_default() += 1;
        Ok(())
    }

    async fn apply_tally(&self, tally: &ResolutionTally) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&tally.task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {}", tally.task_id)))?;
        task.counters.manual_resolved += tally.resolved;
        task.counters.anomalies_processed += tally.resolved;
        match tally.action {
            ResolutionAction::Skip => task.counters.skip_count += tally.resolved,
            ResolutionAction::Overwrite => task.counters.overwrite_count += tally.resolved,
        }
        task.status = tally.status;
        task.progress_last_at = Some(tally.at);
        *state.writes.entry(tally.task_id).or_default() += 1;
        Ok(())
    }

    async fn tasks_for_batch(&self, batch_id: Uuid) -> StorageResult<Vec<ImportTask>> {
        let state = self.state.lock().await;
        let mut tasks = state
            .tasks
            .values()
            .filter(|t| t.batch_id == batch_id)
            .cloned()
            .collect::<Vec<_>>();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.file_name.cmp(&b.file_name)));
        Ok(tasks)
    }

    async fn delete_batch_tasks(&self, batch_id: Uuid) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.tasks.len();
        state.tasks.retain(|_, t| t.batch_id != batch_id);
        Ok((before - state.tasks.len()) as u64)
    }
}
