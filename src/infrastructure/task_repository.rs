use crate::domain::models::{DayBucketing, Recurrence, Task, TaskId};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");
const TASK_COLUMNS: &str =
    "id, label, goal_seconds, spent_seconds, tag_ids, category_id, created_at, due_at, recurrence";

/// Durable task storage. Writes are crash-consistent per row.
#[async_trait]
pub trait TaskStorage: Send + Sync {
    async fn persist(&self, task: &Task) -> Result<(), InfraError>;
    async fn remove(&self, task_id: TaskId) -> Result<(), InfraError>;
    async fn load_task(&self, task_id: TaskId) -> Result<Option<Task>, InfraError>;
    /// Tasks occurring on `date` under `bucketing`, in creation order.
    async fn query_by_date(&self, date: NaiveDate, bucketing: &DayBucketing) -> Result<Vec<Task>, InfraError>;
    async fn max_task_id(&self) -> Result<Option<TaskId>, InfraError>;
}

pub fn initialize_database(path: &Path) -> Result<(), InfraError> {
    let connection = Connection::open(path)?;
    connection.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SqliteTaskStorage {
    db_path: PathBuf,
}

impl SqliteTaskStorage {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    /// Runs `work` against a fresh connection on tokio's blocking pool so
    /// SQLite I/O never stalls the async workers.
    async fn with_connection<T, F>(&self, work: F) -> Result<T, InfraError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, InfraError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, InfraError> {
            let connection = Connection::open(&db_path)?;
            work(&connection)
        })
        .await?
    }
}

struct TaskRow {
    id: i64,
    label: String,
    goal_seconds: i64,
    spent_seconds: i64,
    tag_ids: String,
    category_id: Option<i64>,
    created_at: String,
    due_at: String,
    recurrence: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            label: row.get(1)?,
            goal_seconds: row.get(2)?,
            spent_seconds: row.get(3)?,
            tag_ids: row.get(4)?,
            category_id: row.get(5)?,
            created_at: row.get(6)?,
            due_at: row.get(7)?,
            recurrence: row.get(8)?,
        })
    }

    fn into_task(self) -> Result<Task, InfraError> {
        let recurrence = self
            .recurrence
            .as_deref()
            .map(|raw| serde_json::from_str::<Recurrence>(raw))
            .transpose()?;
        Ok(Task {
            id: TaskId(self.id),
            label: self.label,
            goal_seconds: non_negative(self.goal_seconds, "tasks.goal_seconds")?,
            spent_seconds: non_negative(self.spent_seconds, "tasks.spent_seconds")?,
            tag_ids: serde_json::from_str(&self.tag_ids)?,
            category_id: self.category_id,
            created_at: parse_stored_instant(&self.created_at, "tasks.created_at")?,
            due_at: parse_stored_instant(&self.due_at, "tasks.due_at")?,
            recurrence,
        })
    }
}

#[async_trait]
impl TaskStorage for SqliteTaskStorage {
    async fn persist(&self, task: &Task) -> Result<(), InfraError> {
        let task = task.clone();
        self.with_connection(move |connection| {
            let recurrence = task
                .recurrence
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            connection.execute(
                "INSERT INTO tasks (id, label, goal_seconds, spent_seconds, tag_ids, category_id, created_at, due_at, recurrence, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                   label = excluded.label,
                   goal_seconds = excluded.goal_seconds,
                   spent_seconds = excluded.spent_seconds,
                   tag_ids = excluded.tag_ids,
                   category_id = excluded.category_id,
                   due_at = excluded.due_at,
                   recurrence = excluded.recurrence,
                   updated_at = excluded.updated_at",
                params![
                    task.id.0,
                    task.label,
                    to_sql_seconds(task.goal_seconds),
                    to_sql_seconds(task.spent_seconds),
                    serde_json::to_string(&task.tag_ids)?,
                    task.category_id,
                    format_instant(task.created_at),
                    format_instant(task.due_at),
                    recurrence,
                    format_instant(Utc::now()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, task_id: TaskId) -> Result<(), InfraError> {
        self.with_connection(move |connection| {
            connection.execute("DELETE FROM tasks WHERE id = ?1", params![task_id.0])?;
            Ok(())
        })
        .await
    }

    async fn load_task(&self, task_id: TaskId) -> Result<Option<Task>, InfraError> {
        self.with_connection(move |connection| {
            let row = connection
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                    params![task_id.0],
                    TaskRow::from_row,
                )
                .optional()?;
            row.map(TaskRow::into_task).transpose()
        })
        .await
    }

    async fn query_by_date(&self, date: NaiveDate, bucketing: &DayBucketing) -> Result<Vec<Task>, InfraError> {
        let bucketing = *bucketing;
        self.with_connection(move |connection| {
            // One-off tasks only match inside the day's UTC window; recurring
            // tasks due before its end still need the calendar check.
            let day_start = bucketing.start_of_day(date);
            let day_end = bucketing.start_of_day(date + Duration::days(1));
            let mut statement = connection.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE due_at < ?2 AND (due_at >= ?1 OR recurrence IS NOT NULL)
                 ORDER BY created_at, id"
            ))?;
            let rows = statement
                .query_map(
                    params![format_instant(day_start), format_instant(day_end)],
                    TaskRow::from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;

            let mut tasks = Vec::new();
            for row in rows {
                let task = row.into_task()?;
                if bucketing.occurs_on(&task, date) {
                    tasks.push(task);
                }
            }
            Ok(tasks)
        })
        .await
    }

    async fn max_task_id(&self) -> Result<Option<TaskId>, InfraError> {
        self.with_connection(|connection| {
            let max: Option<i64> =
                connection.query_row("SELECT MAX(id) FROM tasks", [], |row| row.get(0))?;
            Ok(max.map(TaskId))
        })
        .await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskStorage {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
}

impl InMemoryTaskStorage {
    fn tasks(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<TaskId, Task>>, InfraError> {
        self.tasks
            .lock()
            .map_err(|error| InfraError::poisoned("task storage", error))
    }

    pub fn snapshot(&self, task_id: TaskId) -> Result<Option<Task>, InfraError> {
        Ok(self.tasks()?.get(&task_id).cloned())
    }

    pub fn len(&self) -> Result<usize, InfraError> {
        Ok(self.tasks()?.len())
    }
}

#[async_trait]
impl TaskStorage for InMemoryTaskStorage {
    async fn persist(&self, task: &Task) -> Result<(), InfraError> {
        self.tasks()?.insert(task.id, task.clone());
        Ok(())
    }

    async fn remove(&self, task_id: TaskId) -> Result<(), InfraError> {
        self.tasks()?.remove(&task_id);
        Ok(())
    }

    async fn load_task(&self, task_id: TaskId) -> Result<Option<Task>, InfraError> {
        self.snapshot(task_id)
    }

    async fn query_by_date(&self, date: NaiveDate, bucketing: &DayBucketing) -> Result<Vec<Task>, InfraError> {
        let mut tasks = self
            .tasks()?
            .values()
            .filter(|task| bucketing.occurs_on(task, date))
            .cloned()
            .collect::<Vec<_>>();
        tasks.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then(left.id.cmp(&right.id))
        });
        Ok(tasks)
    }

    async fn max_task_id(&self) -> Result<Option<TaskId>, InfraError> {
        Ok(self.tasks()?.keys().next_back().copied())
    }
}

/// Fixed-width UTC text so that SQL string comparison matches time order.
fn format_instant(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stored_instant(value: &str, field_name: &str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| InfraError::InvalidConfig(format!("invalid {field_name} '{value}': {error}")))
}

fn to_sql_seconds(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn non_negative(value: i64, field_name: &str) -> Result<u64, InfraError> {
    u64::try_from(value)
        .map_err(|_| InfraError::InvalidConfig(format!("{field_name} must be >= 0, got {value}")))
}
