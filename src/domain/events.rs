use crate::domain::models::{Task, TaskId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Manual,
    Backgrounded,
    Periodic,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Backgrounded => "backgrounded",
            Self::Periodic => "periodic",
        }
    }
}

/// Change records published by the store. Subscribers observe every mutation
/// through these instead of polling store state.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    TaskChanged {
        task: Task,
    },
    TaskDeleted {
        task_id: TaskId,
    },
    TimerStarted {
        task_id: TaskId,
        started_at: DateTime<Utc>,
    },
    TimerStopped {
        task: Task,
    },
    DayInvalidated {
        date: NaiveDate,
    },
    CacheCleared,
    FlushCompleted {
        trigger: FlushTrigger,
        persisted: Vec<TaskId>,
        requeued: Vec<TaskId>,
    },
}
