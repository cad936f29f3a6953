//! TaskStore port - the durable record of queued work.

use std::time::Duration;

use async_trait::async_trait;

use crate::app::status::QueueCounts;
use crate::domain::{Failure, StoreError, TaskId, TaskRecord, TaskType};

/// Crash-safe bookkeeping of the task lifecycle.
///
/// # Design principles
/// - Sole authority for task state; the pool never writes it.
/// - Every transition is one write, atomic with respect to the row `id`.
/// - Claim order is FIFO by `created_at` (ties broken by `id`).
///
/// A claim is two calls: `claim_next` (read) then `mark_processing`
/// (conditional write). `mark_processing` returns `false` when the row is no
/// longer eligible, so two pollers racing on one row cannot both start it.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a `Pending` task with `attempts = 0`.
    async fn enqueue(
        &self,
        task_type: &TaskType,
        payload: &[u8],
        max_attempts: u32,
    ) -> Result<TaskId, StoreError>;

    /// Up to `limit` claim-eligible tasks, oldest first.
    ///
    /// Eligible means `Pending`, or `Failed` with `attempts < max_attempts`.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError>;

    /// The oldest claim-eligible task, if any.
    async fn claim_next(&self) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.claim_batch(1).await?.into_iter().next())
    }

    /// Eligible -> Processing, incrementing `attempts`.
    ///
    /// `Ok(false)` if the task exists but is no longer eligible.
    async fn mark_processing(&self, id: TaskId) -> Result<bool, StoreError>;

    /// Processing -> Completed, stamping `processed_at`.
    async fn mark_completed(&self, id: TaskId) -> Result<(), StoreError>;

    /// Processing -> Failed.
    async fn mark_failed(&self, id: TaskId, failure: Failure) -> Result<(), StoreError>;

    /// Processing rows whose `updated_at` is older than `threshold` go back
    /// to Pending, or to an exhausted Failed if that was their last permitted
    /// attempt. Returns the number of rows released from Processing.
    async fn recover_stuck(&self, threshold: Duration) -> Result<u64, StoreError>;

    /// Delete Completed rows processed more than `retention_days` ago.
    /// Returns the number deleted.
    async fn cleanup(&self, retention_days: u32) -> Result<u64, StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Pending, Processing and Failed rows, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>, StoreError>;

    async fn counts_by_status(&self) -> Result<QueueCounts, StoreError>;
}
