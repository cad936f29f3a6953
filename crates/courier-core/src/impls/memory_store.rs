//! In-memory task store.
//!
//! Same semantics as the SQLite store, without durability. State lives behind
//! one async mutex, so every transition is trivially atomic.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{cutoff, retention_window};
use crate::app::status::QueueCounts;
use crate::domain::{Failure, StoreError, TaskId, TaskRecord, TaskStatus, TaskType};
use crate::ports::{Clock, SystemClock, TaskStore};

struct InMemoryState {
    records: BTreeMap<TaskId, TaskRecord>,
    next_task_id: i64,
}

impl InMemoryState {
    fn allocate_task_id(&mut self) -> TaskId {
        let id = TaskId::new(self.next_task_id);
        self.next_task_id += 1;
        id
    }

    fn processing_mut(
        &mut self,
        id: TaskId,
        to: TaskStatus,
    ) -> Result<&mut TaskRecord, StoreError> {
        let record = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.status != TaskStatus::Processing {
            return Err(StoreError::InvalidTransition {
                id,
                from: record.status,
                to,
            });
        }
        Ok(record)
    }

    fn oldest_first<'a>(&'a self, filter: impl Fn(&TaskRecord) -> bool) -> Vec<&'a TaskRecord> {
        let mut tasks: Vec<&TaskRecord> = self
            .records
            .values()
            .filter(|r: &&TaskRecord| filter(*r))
            .collect();
        tasks.sort_by_key(|r| (r.created_at, r.id));
        tasks
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<InMemoryState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(InMemoryState {
                records: BTreeMap::new(),
                next_task_id: 1,
            }),
            clock,
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(
        &self,
        task_type: &TaskType,
        payload: &[u8],
        max_attempts: u32,
    ) -> Result<TaskId, StoreError> {
        if max_attempts == 0 {
            return Err(StoreError::InvalidMaxAttempts);
        }
        let mut state = self.state.lock().await;
        let id = state.allocate_task_id();
        let record = TaskRecord::new(
            id,
            task_type.clone(),
            payload.to_vec(),
            max_attempts,
            self.clock.now(),
        );
        state.records.insert(id, record);
        Ok(id)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .oldest_first(TaskRecord::is_claimable)
            .into_iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_processing(&self, id: TaskId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !record.is_claimable() {
            return Ok(false);
        }
        record.start_attempt(self.clock.now());
        Ok(true)
    }

    async fn mark_completed(&self, id: TaskId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state.processing_mut(id, TaskStatus::Completed)?;
        record.mark_completed(self.clock.now());
        Ok(())
    }

    async fn mark_failed(&self, id: TaskId, failure: Failure) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state.processing_mut(id, TaskStatus::Failed)?;
        record.mark_failed(&failure, self.clock.now());
        Ok(())
    }

    async fn recover_stuck(&self, threshold: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let stale_before = cutoff(now, threshold);
        let mut state = self.state.lock().await;
        let mut recovered = 0;
        for record in state.records.values_mut() {
            if record.status == TaskStatus::Processing && record.updated_at < stale_before {
                record.recover(now);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn cleanup(&self, retention_days: u32) -> Result<u64, StoreError> {
        let processed_before = cutoff(self.clock.now(), retention_window(retention_days));
        let mut state = self.state.lock().await;
        let before = state.records.len();
        state.records.retain(|_, r| {
            !(r.status == TaskStatus::Completed
                && r.processed_at.is_some_and(|at| at <= processed_before))
        });
        Ok((before - state.records.len()) as u64)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .oldest_first(|r| r.status != TaskStatus::Completed)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn counts_by_status(&self) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for record in state.records.values() {
            counts.record(record);
        }
        Ok(counts)
    }
}
