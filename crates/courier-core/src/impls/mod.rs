//! Impls - TaskStore implementations.
//!
//! - **SqliteTaskStore**: durable store on an embedded SQLite database
//! - **InMemoryTaskStore**: ephemeral store for tests and dry runs

pub mod memory_store;
pub mod sqlite_store;

pub use self::memory_store::InMemoryTaskStore;
pub use self::sqlite_store::SqliteTaskStore;

use chrono::{DateTime, Utc};
use std::time::Duration;

/// `now - window`, saturating at the earliest representable instant.
pub(crate) fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn retention_window(days: u32) -> Duration {
    Duration::from_secs(u64::from(days) * 24 * 60 * 60)
}
