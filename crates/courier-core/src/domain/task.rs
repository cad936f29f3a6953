//! Task record: the persisted unit of deferred work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{TaskId, TaskStatus};

/// String tag selecting a handler (e.g. `upload-movie`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// `last_error` of a task whose last permitted attempt never reported back.
pub const ABANDONED_ON_FINAL_ATTEMPT: &str = "abandoned on final attempt";

/// Why an attempt failed, and whether another attempt may follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: String,
    pub terminal: bool,
}

impl Failure {
    /// The task stays claimable while `attempts < max_attempts`.
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            terminal: false,
        }
    }

    /// No further attempts, whatever the remaining budget.
    ///
    /// Implemented by lowering `max_attempts` to the attempts already made,
    /// which keeps `attempts` an honest count of processing starts.
    pub fn terminal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            terminal: true,
        }
    }
}

/// A task row.
///
/// The store is the single source of truth for these fields; workers never
/// write them directly.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,

    /// Handler-defined bytes, never interpreted by the queue.
    pub payload: Vec<u8>,

    pub status: TaskStatus,

    /// Number of processing starts (including the current one while Processing).
    pub attempts: u32,
    pub max_attempts: u32,

    /// Last failure reason, cleared on completion.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Refreshed on every transition; the staleness signal for stuck tasks.
    pub updated_at: DateTime<Utc>,

    /// Set if and only if `status == Completed`.
    pub processed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        payload: Vec<u8>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            payload,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    /// Eligible for a claim: Pending, or Failed with attempts left.
    pub fn is_claimable(&self) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Failed => self.attempts < self.max_attempts,
            TaskStatus::Processing | TaskStatus::Completed => false,
        }
    }

    /// Failed with no attempts left.
    pub fn is_exhausted(&self) -> bool {
        self.status == TaskStatus::Failed && self.attempts >= self.max_attempts
    }

    /// Pending/Failed -> Processing, counting the attempt.
    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.attempts += 1;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.last_error = None;
        self.processed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, failure: &Failure, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        if failure.terminal {
            self.max_attempts = self.attempts;
        }
        self.last_error = Some(failure.reason.clone());
        self.updated_at = now;
    }

    /// Release crash-abandoned work: Processing -> Pending while attempts
    /// remain, otherwise Processing -> Failed with the budget spent.
    pub fn recover(&mut self, now: DateTime<Utc>) {
        if self.attempts < self.max_attempts {
            self.status = TaskStatus::Pending;
        } else {
            self.status = TaskStatus::Failed;
            self.last_error = Some(ABANDONED_ON_FINAL_ATTEMPT.to_string());
        }
        self.updated_at = now;
    }
}
