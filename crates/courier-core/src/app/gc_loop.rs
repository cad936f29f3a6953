//! GcLoop - deletes completed tasks past the retention window.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::domain::StoreError;
use crate::ports::TaskStore;

/// Runs `TaskStore::cleanup` on a fixed interval until shutdown.
///
/// The first run happens one full interval after start.
pub struct GcLoop {
    store: Arc<dyn TaskStore>,
    interval: Duration,
    retention_days: u32,
}

impl GcLoop {
    pub fn new(store: Arc<dyn TaskStore>, interval: Duration, retention_days: u32) -> Self {
        Self {
            store,
            interval,
            retention_days,
        }
    }

    pub async fn run_once(&self) -> Result<u64, StoreError> {
        let removed = self.store.cleanup(self.retention_days).await?;
        if removed > 0 {
            info!(removed, retention_days = self.retention_days, "cleaned up completed tasks");
        }
        Ok(removed)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "cleanup failed");
                    }
                }
            }
        }
    }
}
