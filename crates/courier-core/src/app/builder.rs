//! DispatcherBuilder - handler wiring and startup validation.

use std::sync::Arc;

use thiserror::Error;

use super::dispatcher::{Dispatcher, DispatcherConfig};
use crate::domain::{PoolError, TaskType};
use crate::ports::TaskStore;
use crate::typed::{Handler, HandlerRegistry, RegistryError, Task, TaskHandler};

/// Builds a [`Dispatcher`].
///
/// # Example
/// ```ignore
/// let dispatcher = DispatcherBuilder::new(store)
///     .config(config.dispatcher_config())
///     .register_typed::<UploadPayload, _>(UploadMovieHandler)?
///     .expect_tasks(&["upload-movie"])
///     .build()?;
/// ```
///
/// `build` fails if any type named in `expect_tasks` has no handler.
pub struct DispatcherBuilder {
    store: Arc<dyn TaskStore>,
    registry: HandlerRegistry,
    config: DispatcherConfig,
    expected_tasks: Option<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl DispatcherBuilder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            registry: HandlerRegistry::new(),
            config: DispatcherConfig::default(),
            expected_tasks: None,
        }
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a raw-payload handler.
    pub fn register(
        mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(task_type, handler)?;
        Ok(self)
    }

    /// Register a handler that receives `T` decoded from JSON.
    pub fn register_typed<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Dispatcher, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered = self.registry.registered_types();
            let missing: Vec<String> = expected_tasks
                .iter()
                .filter(|t| !registered.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }
        Ok(Dispatcher::new(self.store, self.registry, self.config)?)
    }
}
