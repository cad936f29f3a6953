//! Domain model (ids, task records, statuses, errors).

pub mod errors;
pub mod ids;
pub mod status;
pub mod task;

pub use self::errors::{HandlerError, JobError, PoolError, StoreError};
pub use self::ids::TaskId;
pub use self::status::TaskStatus;
pub use self::task::{ABANDONED_ON_FINAL_ATTEMPT, Failure, TaskRecord, TaskType};
