//! App - the dispatcher and its supporting loops.
//!
//! # Components
//! - **DispatcherBuilder**: handler registration and startup validation
//! - **Dispatcher**: startup recovery, poll loop (claim -> mark -> submit)
//! - **GcLoop**: periodic removal of old completed tasks
//! - **QueueCounts**: status view over the store

pub mod builder;
pub mod dispatcher;
pub mod gc_loop;
pub mod status;

pub use self::builder::{BuildError, DispatcherBuilder};
pub use self::dispatcher::{DispatchError, Dispatcher, DispatcherConfig};
pub use self::gc_loop::GcLoop;
pub use self::status::QueueCounts;
