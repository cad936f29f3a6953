//! Typed - handlers and their registry.
//!
//! # Two layers
//! - **Surface (typed)**: `Task` trait, `Handler<T>` trait. The task type
//!   string comes from `T::TYPE`, so it cannot be misspelled at a call site.
//! - **Inside (bytes)**: `TaskHandler`, object-safe, receives the raw payload.
//!   `TypedHandler<T, H>` erases a typed handler into this shape.

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{FnHandler, Handler, TaskHandler, TypedHandler, handler_fn};
pub use self::registry::{HandlerRegistry, RegistryError};
pub use self::task::Task;
