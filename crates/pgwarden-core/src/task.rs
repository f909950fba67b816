//! Cancellable periodic background tasks
//!
//! A [`PeriodicTask`] runs an async tick on a fixed period until it is
//! stopped. Ticks never overlap, a panicking tick is logged and the loop keeps
//! going, and [`PeriodicTask::stop`] cancels and joins so shutdown is
//! deterministic. Dropping the handle without calling `stop` also ends the
//! loop after the current tick.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Handle to a running periodic task
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    period: Duration,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period`. The first tick fires one full period
    /// after spawning.
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let period = period.max(Duration::from_millis(1));
        let (cancel, mut cancelled) = watch::channel(false);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(task = %task_name, period_ms = period.as_millis() as u64, "Periodic task started");

            loop {
                tokio::select! {
                    biased;
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if AssertUnwindSafe(tick()).catch_unwind().await.is_err() {
                            error!(task = %task_name, "Periodic task tick panicked; continuing");
                        }
                    }
                }
            }

            debug!(task = %task_name, "Periodic task stopped");
        });

        Self {
            name,
            period,
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the task and wait for an in-flight tick to complete
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.handle.await {
            warn!(task = %self.name, error = %e, "Periodic task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let task = PeriodicTask::spawn("counter", Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        task.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_tick_does_not_stop_the_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let task = PeriodicTask::spawn("flaky", Duration::from_secs(1), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first tick fails");
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!task.is_finished());
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_ends_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let task = PeriodicTask::spawn("dropped", Duration::from_secs(1), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        drop(task);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
