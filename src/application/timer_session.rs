use crate::application::store::TaskStore;
use crate::domain::clock::Clock;
use crate::domain::events::StoreEvent;
use crate::domain::models::{Task, TaskId};
use crate::domain::timer::{ActiveSession, TimerSnapshot, TimerState};
use crate::infrastructure::background_timer::{BackgroundTimer, BackgroundWake};
use crate::infrastructure::command_log::CommandLog;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::task_repository::TaskStorage;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub stopped: Option<Task>,
    pub started: ActiveSession,
}

/// Runs at most one timing session and folds elapsed time into the running
/// task. Spent time is always derived from `started_at` and the clock, so the
/// number of ticks never changes the result.
pub struct TimerSessionService<S: TaskStorage> {
    store: Arc<TaskStore<S>>,
    background: Arc<dyn BackgroundTimer>,
    log: Arc<CommandLog>,
    state: Mutex<TimerState>,
    tick_interval: Option<Duration>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: TaskStorage + 'static> TimerSessionService<S> {
    pub fn new(store: Arc<TaskStore<S>>, background: Arc<dyn BackgroundTimer>, log: Arc<CommandLog>) -> Self {
        Self {
            store,
            background,
            log,
            state: Mutex::new(TimerState::new()),
            tick_interval: None,
            ticker: Mutex::new(None),
        }
    }

    /// Enables the foreground ticker while a session runs.
    pub fn with_tick_interval(mut self, tick_interval: Option<Duration>) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, TimerState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::poisoned("timer state", error))
    }

    pub fn snapshot(&self) -> Result<TimerSnapshot, InfraError> {
        let state = self.lock_state()?;
        Ok(state.snapshot(self.store.clock().now()))
    }

    pub fn running_task(&self) -> Result<Option<TaskId>, InfraError> {
        Ok(self.lock_state()?.active().map(|session| session.task_id))
    }

    pub async fn start(self: &Arc<Self>, task_id: TaskId) -> Result<ActiveSession, InfraError> {
        if let Some(running) = self.lock_state()?.active() {
            return Err(InfraError::AlreadyRunning {
                running: running.task_id,
            });
        }

        let loaded = self.store.task(task_id).await?;
        let session = {
            let mut state = self.lock_state()?;
            let accumulated = self
                .store
                .cached_task(task_id)?
                .unwrap_or(loaded)
                .spent_seconds;
            state
                .begin(task_id, self.store.clock().now(), accumulated)
                .map_err(|running| InfraError::AlreadyRunning {
                    running: running.task_id,
                })?
        };

        self.begin_counting(&session);
        self.spawn_ticker();
        self.store.publish(StoreEvent::TimerStarted {
            task_id,
            started_at: session.started_at,
        });
        Ok(session)
    }

    /// Writes `accumulated_before + elapsed` into the running task. Idle is a no-op.
    pub fn tick(&self) -> Result<Option<Task>, InfraError> {
        let state = self.lock_state()?;
        let Some(session) = state.active().copied() else {
            return Ok(None);
        };
        let spent = session.spent_at(self.store.clock().now());
        self.store.record_spent(session.task_id, spent).map(Some)
    }

    /// Final tick, then back to idle. Stopping an idle timer returns `Ok(None)`.
    pub fn stop(&self) -> Result<Option<Task>, InfraError> {
        let recorded = {
            let mut state = self.lock_state()?;
            let Some(session) = state.end() else {
                return Ok(None);
            };
            let spent = session.spent_at(self.store.clock().now());
            self.store.record_spent(session.task_id, spent)
        };

        self.cancel_ticker();
        self.end_counting();
        let task = recorded?;
        self.store.publish(StoreEvent::TimerStopped { task: task.clone() });
        Ok(Some(task))
    }

    /// Stops whatever runs and starts `task_id` in one step.
    pub async fn switch(self: &Arc<Self>, task_id: TaskId) -> Result<SwitchOutcome, InfraError> {
        let loaded = self.store.task(task_id).await?;
        let (stopped, started) = {
            let mut state = self.lock_state()?;
            let now = self.store.clock().now();
            let stopped = match state.end() {
                Some(previous) => Some(
                    self.store
                        .record_spent(previous.task_id, previous.spent_at(now))?,
                ),
                None => None,
            };
            let accumulated = self
                .store
                .cached_task(task_id)?
                .unwrap_or(loaded)
                .spent_seconds;
            let started = state
                .begin(task_id, now, accumulated)
                .map_err(|running| InfraError::AlreadyRunning {
                    running: running.task_id,
                })?;
            (stopped, started)
        };

        if let Some(task) = &stopped {
            self.end_counting();
            self.store.publish(StoreEvent::TimerStopped { task: task.clone() });
        }
        self.begin_counting(&started);
        self.spawn_ticker();
        self.store.publish(StoreEvent::TimerStarted {
            task_id,
            started_at: started.started_at,
        });
        Ok(SwitchOutcome { stopped, started })
    }

    /// Applies a clock change (override set or cleared) without moving time
    /// in or out of the running session. The session is ticked in the old
    /// frame, then restarted at the new `now()` from the recorded total.
    pub fn shift_clock<T>(&self, change: impl FnOnce(&Clock) -> T) -> Result<T, InfraError> {
        let clock: &Clock = self.store.clock();
        let (outcome, rebased) = {
            let mut state = self.lock_state()?;
            let Some(session) = state.active().copied() else {
                return Ok(change(clock));
            };
            let spent = session.spent_at(clock.now());
            self.store.record_spent(session.task_id, spent)?;

            let outcome = change(clock);
            state.end();
            let rebased = state
                .begin(session.task_id, clock.now(), spent)
                .map_err(|running| InfraError::AlreadyRunning {
                    running: running.task_id,
                })?;
            (outcome, rebased)
        };

        self.begin_counting(&rebased);
        self.log.info(
            "timer_rebase",
            &format!(
                "task_id={} accumulated_before={}",
                rebased.task_id, rebased.accumulated_before
            ),
        );
        Ok(outcome)
    }

    /// Ticks whenever the background counter reports progress for the running task.
    pub fn attach_wake_signals(self: &Arc<Self>, mut wakes: broadcast::Receiver<BackgroundWake>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let wake = match wakes.recv().await {
                    Ok(wake) => wake,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(service) = weak.upgrade() else {
                    break;
                };
                if service.running_task().ok().flatten() != Some(wake.task_id) {
                    continue;
                }
                if let Err(error) = service.tick() {
                    service
                        .log
                        .error("timer_wake", &format!("task_id={} {error}", wake.task_id));
                }
            }
        })
    }

    fn begin_counting(&self, session: &ActiveSession) {
        if let Err(error) = self
            .background
            .start_counting(session.task_id, session.started_at)
        {
            self.log.error(
                "timer_start",
                &format!("background counter unavailable for task {}: {error}", session.task_id),
            );
        }
    }

    fn end_counting(&self) {
        if let Err(error) = self.background.stop_counting() {
            self.log.error("timer_stop", &format!("background counter: {error}"));
        }
    }

    fn spawn_ticker(self: &Arc<Self>) {
        let Some(tick_interval) = self.tick_interval else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                match service.tick() {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(error) => service.log.error("timer_tick", &error.to_string()),
                }
            }
        });

        if let Ok(mut ticker) = self.ticker.lock() {
            if let Some(previous) = ticker.replace(handle) {
                previous.abort();
            }
        }
    }

    fn cancel_ticker(&self) {
        if let Ok(mut ticker) = self.ticker.lock() {
            if let Some(handle) = ticker.take() {
                handle.abort();
            }
        }
    }
}

impl<S: TaskStorage> Drop for TimerSessionService<S> {
    fn drop(&mut self) {
        if let Ok(mut ticker) = self.ticker.lock() {
            if let Some(handle) = ticker.take() {
                handle.abort();
            }
        }
    }
}
