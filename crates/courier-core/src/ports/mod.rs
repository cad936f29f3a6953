//! Ports - the seams between the dispatcher and its collaborators.
//!
//! `TaskStore` is the durable source of truth for task state; `Clock`
//! supplies every timestamp the store writes.

pub mod clock;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::task_store::TaskStore;
