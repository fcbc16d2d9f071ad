pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::commands::AppState;
pub use application::store::TaskStore;
pub use application::sync_flush::{FlushReport, RetryPolicy, SyncFlushService};
pub use application::timer_session::TimerSessionService;
pub use domain::clock::Clock;
pub use domain::events::{FlushTrigger, StoreEvent};
pub use domain::models::{DayBucketing, NewTask, Recurrence, Task, TaskId, TaskPatch};
pub use domain::timer::{TimerSnapshot, TimerStatus};
pub use infrastructure::error::InfraError;
pub use infrastructure::task_repository::{InMemoryTaskStorage, SqliteTaskStorage, TaskStorage};
