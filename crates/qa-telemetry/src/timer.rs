use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// A background task that runs `tick` every `period`, first one period after
/// spawning. The loop ends when `tick` resolves to `false` or the task is
/// stopped. Dropping the handle stops it too.
#[derive(Debug)]
pub struct IntervalTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl IntervalTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !tick().await {
                    debug!(event = "interval_task_finished", task = name);
                    return;
                }
            }
        });
        debug!(event = "interval_task_started", task = name, period_ms = period.as_millis() as u64);
        Self {
            name,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Safe to call any number of times.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!(event = "interval_task_stopped", task = self.name);
        }
    }
}

impl Drop for IntervalTask {
    fn drop(&mut self) {
        self.stop();
    }
}
