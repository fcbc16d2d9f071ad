use crate::domain::clock::Clock;
use crate::domain::events::{FlushTrigger, StoreEvent};
use crate::domain::models::{DayBucketing, NewTask, Task, TaskId, TaskPatch};
use crate::infrastructure::day_cache::DayCache;
use crate::infrastructure::dirty_buffer::{DirtyBuffer, DirtyMutation, DrainedBatch};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::task_repository::TaskStorage;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Process-wide task state for one application session: in-memory tasks, the
/// dirty buffer and the day cache. Durable storage stays the source of truth
/// across restarts; everything here starts empty.
pub struct TaskStore<S: TaskStorage> {
    storage: Arc<S>,
    clock: Arc<Clock>,
    tasks: Mutex<HashMap<TaskId, Task>>,
    next_id: AtomicI64,
    dirty: DirtyBuffer,
    day_cache: DayCache,
    events: broadcast::Sender<StoreEvent>,
}

impl<S: TaskStorage> TaskStore<S> {
    pub async fn open(storage: Arc<S>, clock: Arc<Clock>, bucketing: DayBucketing) -> Result<Self, InfraError> {
        let max_id = storage.max_task_id().await?.map(|id| id.0).unwrap_or(0);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            storage,
            clock,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(max_id + 1),
            dirty: DirtyBuffer::new(),
            day_cache: DayCache::new(bucketing),
            events,
        })
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn dirty_buffer(&self) -> &DirtyBuffer {
        &self.dirty
    }

    pub fn day_cache(&self) -> &DayCache {
        &self.day_cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: StoreEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn lock_tasks(&self) -> Result<MutexGuard<'_, HashMap<TaskId, Task>>, InfraError> {
        self.tasks
            .lock()
            .map_err(|error| InfraError::poisoned("task table", error))
    }

    pub fn create_task(&self, new_task: NewTask) -> Result<Task, InfraError> {
        let task = Task {
            id: TaskId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            label: new_task.label.trim().to_string(),
            goal_seconds: new_task.goal_seconds,
            spent_seconds: 0,
            tag_ids: new_task.tag_ids,
            category_id: new_task.category_id,
            created_at: self.clock.now(),
            due_at: new_task.due_at,
            recurrence: new_task.recurrence,
        };
        task.validate().map_err(InfraError::InvalidConfig)?;

        {
            let mut tasks = self.lock_tasks()?;
            tasks.insert(task.id, task.clone());
            self.dirty.mark_dirty(DirtyMutation::Upsert(task.clone()))?;
        }

        self.invalidate_for(&task, None)?;
        self.publish(StoreEvent::TaskChanged { task: task.clone() });
        Ok(task)
    }

    pub async fn update_task(&self, task_id: TaskId, patch: &TaskPatch) -> Result<Task, InfraError> {
        self.task(task_id).await?;

        let (previous, updated) = {
            let mut tasks = self.lock_tasks()?;
            let task = tasks
                .get_mut(&task_id)
                .ok_or(InfraError::TaskNotFound(task_id))?;
            let previous = task.clone();
            let mut updated = previous.clone();
            patch.apply_to(&mut updated);
            updated.validate().map_err(InfraError::InvalidConfig)?;
            *task = updated.clone();
            self.dirty.mark_dirty(DirtyMutation::Upsert(updated.clone()))?;
            (previous, updated)
        };

        self.invalidate_for(&updated, Some(&previous))?;
        self.publish(StoreEvent::TaskChanged {
            task: updated.clone(),
        });
        Ok(updated)
    }

    pub async fn delete_task(&self, task_id: TaskId) -> Result<bool, InfraError> {
        match self.task(task_id).await {
            Ok(_) => {}
            Err(InfraError::TaskNotFound(_)) => return Ok(false),
            Err(error) => return Err(error),
        }

        let removed = {
            let mut tasks = self.lock_tasks()?;
            let Some(removed) = tasks.remove(&task_id) else {
                return Ok(false);
            };
            self.dirty.mark_dirty(DirtyMutation::Delete(removed.clone()))?;
            removed
        };

        self.invalidate_for(&removed, None)?;
        self.publish(StoreEvent::TaskDeleted { task_id });
        Ok(true)
    }

    /// The in-memory task, loading it from storage on first use.
    pub async fn task(&self, task_id: TaskId) -> Result<Task, InfraError> {
        if let Some(task) = self.cached_task(task_id)? {
            return Ok(task);
        }
        if self
            .dirty
            .latest(task_id)?
            .is_some_and(|mutation| mutation.is_delete())
        {
            return Err(InfraError::TaskNotFound(task_id));
        }

        let loaded = self
            .storage
            .load_task(task_id)
            .await?
            .ok_or(InfraError::TaskNotFound(task_id))?;
        let mut tasks = self.lock_tasks()?;
        // A concurrent caller may have registered a newer copy meanwhile.
        Ok(tasks.entry(task_id).or_insert(loaded).clone())
    }

    pub fn cached_task(&self, task_id: TaskId) -> Result<Option<Task>, InfraError> {
        Ok(self.lock_tasks()?.get(&task_id).cloned())
    }

    /// Sets the absolute spent duration of a task and marks it dirty.
    pub(crate) fn record_spent(&self, task_id: TaskId, spent_seconds: u64) -> Result<Task, InfraError> {
        let task = {
            let mut tasks = self.lock_tasks()?;
            let task = tasks
                .get_mut(&task_id)
                .ok_or(InfraError::TaskNotFound(task_id))?;
            task.spent_seconds = spent_seconds;
            let snapshot = task.clone();
            self.dirty.mark_dirty(DirtyMutation::Upsert(snapshot.clone()))?;
            snapshot
        };
        self.publish(StoreEvent::TaskChanged { task: task.clone() });
        Ok(task)
    }

    /// Tasks occurring on `date`, in creation order. Storage rows are cached
    /// per day; unpersisted mutations are laid over them on every read.
    pub async fn load_day(&self, date: NaiveDate) -> Result<Vec<Task>, InfraError> {
        let (mut tasks, bucketing) = match self.day_cache.get(date)? {
            Some(cached) => (cached, self.day_cache.bucketing()?),
            None => {
                let ticket = self.day_cache.begin_load()?;
                let rows = self
                    .storage
                    .query_by_date(date, &ticket.bucketing)
                    .await?;
                self.day_cache.store(date, ticket, rows.clone())?;
                (rows, ticket.bucketing)
            }
        };

        for mutation in self.dirty.unpersisted()? {
            let task_id = mutation.task_id();
            tasks.retain(|task| task.id != task_id);
            if let DirtyMutation::Upsert(task) = mutation {
                if bucketing.occurs_on(&task, date) {
                    tasks.push(task);
                }
            }
        }
        tasks.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then(left.id.cmp(&right.id))
        });
        Ok(tasks)
    }

    pub fn bucketing(&self) -> Result<DayBucketing, InfraError> {
        self.day_cache.bucketing()
    }

    /// Applies new timezone / week-start settings. Returns whether anything changed.
    pub fn reconfigure(&self, bucketing: DayBucketing) -> Result<bool, InfraError> {
        let changed = self.day_cache.reconfigure(bucketing)?;
        if changed {
            self.publish(StoreEvent::CacheCleared);
        }
        Ok(changed)
    }

    /// Settles a drained batch: requeues what failed and evicts the cached days
    /// of what was persisted. Returns the requeued ids.
    pub(crate) fn complete_flush(
        &self,
        batch: &DrainedBatch,
        persisted: &[TaskId],
        trigger: FlushTrigger,
    ) -> Result<Vec<TaskId>, InfraError> {
        let requeued = self.dirty.settle(batch.id, persisted)?;
        for mutation in batch
            .entries
            .iter()
            .filter(|mutation| persisted.contains(&mutation.task_id()))
        {
            self.invalidate_for(mutation.task(), None)?;
        }
        self.publish(StoreEvent::FlushCompleted {
            trigger,
            persisted: persisted.to_vec(),
            requeued: requeued.clone(),
        });
        Ok(requeued)
    }

    fn invalidate_for(&self, task: &Task, previous: Option<&Task>) -> Result<(), InfraError> {
        for date in self.day_cache.invalidate_task(task, previous)? {
            self.publish(StoreEvent::DayInvalidated { date });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::task_repository::InMemoryTaskStorage;
    use chrono::{DateTime, Utc, Weekday};

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn fixed_clock(value: &str) -> Arc<Clock> {
        let now = fixed_time(value);
        Arc::new(Clock::with_now_provider(Arc::new(move || now)))
    }

    fn new_task(label: &str, due: &str) -> NewTask {
        NewTask {
            label: label.to_string(),
            goal_seconds: 1800,
            due_at: fixed_time(due),
            tag_ids: Vec::new(),
            category_id: None,
            recurrence: None,
        }
    }

    async fn open_store(storage: Arc<InMemoryTaskStorage>) -> TaskStore<InMemoryTaskStorage> {
        TaskStore::open(
            storage,
            fixed_clock("2024-03-09T08:00:00Z"),
            DayBucketing::default(),
        )
        .await
        .expect("open store")
    }

    #[tokio::test]
    async fn ids_continue_after_persisted_maximum() {
        let storage = Arc::new(InMemoryTaskStorage::default());
        let seeded = Task {
            id: TaskId(41),
            label: "existing".to_string(),
            goal_seconds: 0,
            spent_seconds: 0,
            tag_ids: Vec::new(),
            category_id: None,
            created_at: fixed_time("2024-03-01T00:00:00Z"),
            due_at: fixed_time("2024-03-01T00:00:00Z"),
            recurrence: None,
        };
        storage.persist(&seeded).await.expect("seed");

        let store = open_store(storage).await;
        let created = store
            .create_task(new_task("next", "2024-03-10T09:00:00Z"))
            .expect("create");
        assert_eq!(created.id, TaskId(42));
    }

    #[tokio::test]
    async fn created_task_is_visible_before_flush() {
        let store = open_store(Arc::new(InMemoryTaskStorage::default())).await;
        assert!(store.load_day(date("2024-03-10")).await.expect("empty day").is_empty());

        let created = store
            .create_task(new_task("Write report", "2024-03-10T09:00:00Z"))
            .expect("create");
        let day = store.load_day(date("2024-03-10")).await.expect("load day");
        assert_eq!(day, vec![created.clone()]);
        assert!(store.dirty_buffer().is_dirty(created.id).expect("dirty"));
    }

    #[tokio::test]
    async fn create_rejects_blank_label() {
        let store = open_store(Arc::new(InMemoryTaskStorage::default())).await;
        let result = store.create_task(new_task("   ", "2024-03-10T09:00:00Z"));
        assert!(matches!(result, Err(InfraError::InvalidConfig(_))));
        assert_eq!(store.dirty_buffer().pending_len().expect("pending"), 0);
    }

    #[tokio::test]
    async fn moving_due_date_moves_task_between_days() {
        let store = open_store(Arc::new(InMemoryTaskStorage::default())).await;
        let created = store
            .create_task(new_task("Move me", "2024-03-10T09:00:00Z"))
            .expect("create");

        store
            .update_task(
                created.id,
                &TaskPatch {
                    due_at: Some(fixed_time("2024-03-12T09:00:00Z")),
                    ..TaskPatch::default()
                },
            )
            .await
            .expect("update");

        assert!(store.load_day(date("2024-03-10")).await.expect("old day").is_empty());
        assert_eq!(store.load_day(date("2024-03-12")).await.expect("new day").len(), 1);
    }

    #[tokio::test]
    async fn deleted_task_disappears_and_reports_missing() {
        let storage = Arc::new(InMemoryTaskStorage::default());
        let store = open_store(Arc::clone(&storage)).await;
        let created = store
            .create_task(new_task("Gone", "2024-03-10T09:00:00Z"))
            .expect("create");

        assert!(store.delete_task(created.id).await.expect("delete"));
        assert!(!store.delete_task(created.id).await.expect("second delete"));
        assert!(store.load_day(date("2024-03-10")).await.expect("day").is_empty());
        assert!(matches!(
            store.task(created.id).await,
            Err(InfraError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn task_is_loaded_from_storage_on_first_use() {
        let storage = Arc::new(InMemoryTaskStorage::default());
        let persisted = Task {
            id: TaskId(5),
            label: "from disk".to_string(),
            goal_seconds: 60,
            spent_seconds: 30,
            tag_ids: Vec::new(),
            category_id: None,
            created_at: fixed_time("2024-03-01T00:00:00Z"),
            due_at: fixed_time("2024-03-10T00:00:00Z"),
            recurrence: None,
        };
        storage.persist(&persisted).await.expect("seed");
        let store = open_store(storage).await;

        assert_eq!(store.cached_task(TaskId(5)).expect("cached"), None);
        assert_eq!(store.task(TaskId(5)).await.expect("load"), persisted);
        assert_eq!(store.cached_task(TaskId(5)).expect("cached"), Some(persisted));
    }

    #[tokio::test]
    async fn reconfigure_clears_cache_and_publishes() {
        let store = open_store(Arc::new(InMemoryTaskStorage::default())).await;
        let mut events = store.subscribe();
        store.load_day(date("2024-03-10")).await.expect("warm cache");
        assert_eq!(store.day_cache().cached_dates().expect("dates").len(), 1);

        let changed = store
            .reconfigure(DayBucketing::new(chrono_tz::Asia::Tokyo, Weekday::Sun))
            .expect("reconfigure");
        assert!(changed);
        assert!(store.day_cache().cached_dates().expect("dates").is_empty());
        assert_eq!(events.try_recv().expect("event"), StoreEvent::CacheCleared);
    }

    #[tokio::test]
    async fn mutations_publish_change_records() {
        let store = open_store(Arc::new(InMemoryTaskStorage::default())).await;
        let mut events = store.subscribe();
        let created = store
            .create_task(new_task("Observed", "2024-03-10T09:00:00Z"))
            .expect("create");
        store.record_spent(created.id, 90).expect("record spent");

        assert_eq!(
            events.try_recv().expect("created event"),
            StoreEvent::TaskChanged {
                task: created.clone()
            }
        );
        match events.try_recv().expect("spent event") {
            StoreEvent::TaskChanged { task } => assert_eq!(task.spent_seconds, 90),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
