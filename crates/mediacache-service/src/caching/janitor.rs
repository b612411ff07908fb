use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::handles::HandleProvider;

use super::store::CacheInner;

/// Periodically sweeps expired entries out of a [`MediaCache`](super::MediaCache).
///
/// The janitor only holds a weak reference to the cache and exits on its own once the cache is
/// dropped. Dropping the janitor stops it as well.
#[derive(Debug)]
pub struct CacheJanitor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CacheJanitor {
    pub(super) fn start<H: HandleProvider>(cache: Weak<CacheInner<H>>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(cache, period, cancel.clone()));
        tracing::debug!("Started cache janitor running every {:?}", period);

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stops the janitor and waits for a running sweep to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::error!(error = &err as &dyn std::error::Error, "Cache janitor failed");
            }
        }
    }

    /// Whether the janitor is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for CacheJanitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<H: HandleProvider>(
    cache: Weak<CacheInner<H>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(cache) = cache.upgrade() else {
                    tracing::debug!("Cache is gone, stopping janitor");
                    break;
                };
                cache.run_maintenance();
            }
        }
    }
}
