use crate::domain::models::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    #[default]
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveSession {
    pub task_id: TaskId,
    pub started_at: DateTime<Utc>,
    /// The task's spent duration when this session began.
    pub accumulated_before: u64,
}

impl ActiveSession {
    /// Whole seconds since the session started. A clock that moved behind the
    /// start instant yields zero rather than negative time.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((now - self.started_at).num_seconds()).unwrap_or(0)
    }

    pub fn spent_at(&self, now: DateTime<Utc>) -> u64 {
        self.accumulated_before
            .saturating_add(self.elapsed_seconds(now))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub status: TimerStatus,
    pub task_id: Option<TaskId>,
    pub started_at: Option<DateTime<Utc>>,
    pub accumulated_before_seconds: u64,
    pub elapsed_seconds: u64,
}

/// Single-session state machine: `Idle -> Running -> Idle`.
#[derive(Debug, Clone, Default)]
pub struct TimerState {
    session: Option<ActiveSession>,
}

impl TimerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> TimerStatus {
        if self.session.is_some() {
            TimerStatus::Running
        } else {
            TimerStatus::Idle
        }
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        self.session.as_ref()
    }

    /// Returns the already running session as the error when not idle.
    pub fn begin(
        &mut self,
        task_id: TaskId,
        started_at: DateTime<Utc>,
        accumulated_before: u64,
    ) -> Result<ActiveSession, ActiveSession> {
        if let Some(running) = self.session {
            return Err(running);
        }
        let session = ActiveSession {
            task_id,
            started_at,
            accumulated_before,
        };
        self.session = Some(session);
        Ok(session)
    }

    pub fn end(&mut self) -> Option<ActiveSession> {
        self.session.take()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> TimerSnapshot {
        match &self.session {
            Some(session) => TimerSnapshot {
                status: TimerStatus::Running,
                task_id: Some(session.task_id),
                started_at: Some(session.started_at),
                accumulated_before_seconds: session.accumulated_before,
                elapsed_seconds: session.elapsed_seconds(now),
            },
            None => TimerSnapshot {
                status: TimerStatus::Idle,
                task_id: None,
                started_at: None,
                accumulated_before_seconds: 0,
                elapsed_seconds: 0,
            },
        }
    }
}
