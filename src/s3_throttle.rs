use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{AcquireError, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Interval, MissedTickBehavior};

/// Spacing and concurrency cap shared by every storage request of the process.
///
/// Supabase Storage rate-limits per project, so uploads from commits, listings from
/// the reconciler and deletes from record removal all draw from the same budget.
#[derive(Clone, Debug)]
pub struct S3Throttle {
    permits: Arc<Semaphore>,
    spacing: Option<Arc<Mutex<Interval>>>,
}

impl S3Throttle {
    /// `max_rps = 0` disables spacing; concurrency is always capped at `max(1, n)`.
    #[must_use]
    pub fn new(max_concurrency: usize, max_rps: u32) -> Self {
        let spacing = (max_rps > 0).then(|| {
            let period = Duration::from_secs_f64(1.0 / f64::from(max_rps));
            let mut interval = time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Arc::new(Mutex::new(interval))
        });

        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            spacing,
        }
    }

    /// Waits for the next request slot. Keep the permit alive until the call finishes.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        if let Some(spacing) = &self.spacing {
            spacing.lock().await.tick().await;
        }
        self.permits.clone().acquire_owned().await
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
