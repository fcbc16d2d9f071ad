use crate::domain::clock::NowProvider;
use crate::domain::models::TaskId;
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const WAKE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BackgroundWake {
    pub task_id: TaskId,
    pub elapsed_seconds: u64,
}

/// Host-side counter that keeps running while the foreground store is
/// suspended. Best effort: the timer session stays correct without it.
pub trait BackgroundTimer: Send + Sync {
    fn start_counting(&self, task_id: TaskId, started_at: DateTime<Utc>) -> Result<(), InfraError>;
    fn stop_counting(&self) -> Result<(), InfraError>;
    fn counting_task(&self) -> Option<TaskId>;
}

/// No native counterpart registered; all accounting happens on foreground ticks.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForegroundOnlyTimer;

impl BackgroundTimer for ForegroundOnlyTimer {
    fn start_counting(&self, _task_id: TaskId, _started_at: DateTime<Utc>) -> Result<(), InfraError> {
        Ok(())
    }

    fn stop_counting(&self) -> Result<(), InfraError> {
        Ok(())
    }

    fn counting_task(&self) -> Option<TaskId> {
        None
    }
}

struct CountingJob {
    task_id: TaskId,
    handle: JoinHandle<()>,
}

/// Counts on a detached tokio task and reports progress only through
/// `BackgroundWake` messages.
pub struct TokioBackgroundTimer {
    wake_every: Duration,
    now_provider: NowProvider,
    wakes: broadcast::Sender<BackgroundWake>,
    job: Mutex<Option<CountingJob>>,
}

impl TokioBackgroundTimer {
    pub fn new(wake_every: Duration) -> Self {
        let (wakes, _) = broadcast::channel(WAKE_CHANNEL_CAPACITY);
        Self {
            wake_every: wake_every.max(Duration::from_millis(1)),
            now_provider: Arc::new(Utc::now),
            wakes,
            job: Mutex::new(None),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackgroundWake> {
        self.wakes.subscribe()
    }
}

impl BackgroundTimer for TokioBackgroundTimer {
    fn start_counting(&self, task_id: TaskId, started_at: DateTime<Utc>) -> Result<(), InfraError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| InfraError::BackgroundTimerUnavailable(error.to_string()))?;
        let mut job = self
            .job
            .lock()
            .map_err(|error| InfraError::poisoned("background timer", error))?;
        if let Some(previous) = job.take() {
            previous.handle.abort();
        }

        let wakes = self.wakes.clone();
        let now_provider = Arc::clone(&self.now_provider);
        let wake_every = self.wake_every;
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(wake_every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let elapsed_seconds =
                    u64::try_from((now_provider() - started_at).num_seconds()).unwrap_or(0);
                // Nobody listening is fine; the counter keeps going.
                let _ = wakes.send(BackgroundWake {
                    task_id,
                    elapsed_seconds,
                });
            }
        });
        *job = Some(CountingJob { task_id, handle });
        Ok(())
    }

    fn stop_counting(&self) -> Result<(), InfraError> {
        let mut job = self
            .job
            .lock()
            .map_err(|error| InfraError::poisoned("background timer", error))?;
        if let Some(previous) = job.take() {
            previous.handle.abort();
        }
        Ok(())
    }

    fn counting_task(&self) -> Option<TaskId> {
        self.job
            .lock()
            .ok()
            .and_then(|job| job.as_ref().map(|job| job.task_id))
    }
}

impl Drop for TokioBackgroundTimer {
    fn drop(&mut self) {
        if let Ok(mut job) = self.job.lock() {
            if let Some(previous) = job.take() {
                previous.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn foreground_only_timer_accepts_everything() {
        let timer = ForegroundOnlyTimer;
        timer
            .start_counting(TaskId(1), Utc::now())
            .expect("start is a no-op");
        assert_eq!(timer.counting_task(), None);
        timer.stop_counting().expect("stop is a no-op");
    }

    #[test]
    fn tokio_timer_without_runtime_is_unavailable() {
        let timer = TokioBackgroundTimer::new(Duration::from_millis(5));
        let result = timer.start_counting(TaskId(1), Utc::now());
        assert!(matches!(result, Err(InfraError::BackgroundTimerUnavailable(_))));
        assert_eq!(timer.counting_task(), None);
    }

    #[tokio::test]
    async fn tokio_timer_emits_wakes_until_stopped() {
        let started_at = Utc::now() - ChronoDuration::seconds(30);
        let timer = TokioBackgroundTimer::new(Duration::from_millis(5));
        let mut wakes = timer.subscribe();

        timer
            .start_counting(TaskId(9), started_at)
            .expect("start counting");
        assert_eq!(timer.counting_task(), Some(TaskId(9)));

        let wake = tokio::time::timeout(Duration::from_secs(2), wakes.recv())
            .await
            .expect("wake before timeout")
            .expect("wake received");
        assert_eq!(wake.task_id, TaskId(9));
        assert!(wake.elapsed_seconds >= 30);

        timer.stop_counting().expect("stop counting");
        assert_eq!(timer.counting_task(), None);
    }
}
