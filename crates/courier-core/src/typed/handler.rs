//! Handler traits.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::domain::HandlerError;

/// Business logic for one task type, fed the raw payload.
///
/// Handlers must tolerate being run more than once for the same task: a
/// crash mid-run leaves the task Processing, and recovery re-runs it.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Typed handler for task `T`.
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<(), HandlerError>;
}

/// Erases `Handler<T>` into a `TaskHandler` by decoding the JSON payload.
pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let task: T = serde_json::from_slice(payload)
            .map_err(|e| HandlerError::InvalidPayload(format!("{}: {e}", T::TYPE)))?;
        self.handler.handle(task).await
    }
}

/// A `TaskHandler` from an async closure.
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        (self.f)(payload.to_vec()).await
    }
}
