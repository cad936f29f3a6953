//! Status views over the task store.

use serde::{Deserialize, Serialize};

use crate::domain::{TaskRecord, TaskStatus};

/// Task counts by lifecycle status.
///
/// `Failed` rows are split by whether they still have attempts left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    /// Failed, still claimable.
    pub retrying: u64,
    /// Failed, attempts exhausted.
    pub dead: u64,
}

impl QueueCounts {
    pub fn record(&mut self, task: &TaskRecord) {
        match task.status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed if task.is_exhausted() => self.dead += 1,
            TaskStatus::Failed => self.retrying += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.retrying + self.dead
    }

    /// Nothing left that the dispatcher could still pick up or is running.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.processing == 0 && self.retrying == 0
    }
}
