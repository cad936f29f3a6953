//! courier-core
//!
//! A persistent, retrying task queue with a bounded worker pool.
//!
//! # Modules
//! - **domain**: task records, ids, statuses, errors
//! - **ports**: the `TaskStore` and `Clock` seams
//! - **impls**: SQLite and in-memory stores
//! - **pool**: bounded-concurrency worker pool with graceful drain
//! - **typed**: handler traits and the task-type registry
//! - **app**: dispatcher, GC loop, builder, status counts
//! - **config**: file + environment configuration

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod pool;
pub mod ports;
pub mod typed;

pub use app::{Dispatcher, DispatcherBuilder, DispatcherConfig, QueueCounts};
pub use config::{ConfigError, CourierConfig};
pub use domain::{HandlerError, StoreError, TaskId, TaskRecord, TaskStatus, TaskType};
pub use impls::{InMemoryTaskStore, SqliteTaskStore};
pub use pool::WorkerPool;
pub use ports::TaskStore;
pub use typed::{Handler, Task, TaskHandler, handler_fn};
