use crate::application::store::TaskStore;
use crate::application::sync_flush::{FlushReport, RetryPolicy, SyncFlushService};
use crate::application::timer_session::TimerSessionService;
use crate::domain::clock::Clock;
use crate::domain::events::{FlushTrigger, StoreEvent};
use crate::domain::models::{parse_date, weekday_name, DayBucketing, NewTask, Recurrence, Task, TaskId, TaskPatch};
use crate::domain::timer::TimerSnapshot;
use crate::infrastructure::background_timer::{BackgroundTimer, BackgroundWake, ForegroundOnlyTimer};
use crate::infrastructure::command_log::CommandLog;
use crate::infrastructure::config::{
    ensure_default_configs, parse_timezone, parse_week_start, read_bucketing, read_sync_settings, save_bucketing,
    SyncSettings,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::task_repository::{initialize_database, SqliteTaskStorage};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

type Store = TaskStore<SqliteTaskStorage>;

const DATABASE_FILE: &str = "daytally.sqlite";

/// Where a workspace keeps its configs, command log and database.
#[derive(Debug, Clone)]
struct WorkspaceLayout {
    workspace_root: PathBuf,
    config_dir: PathBuf,
    logs_dir: PathBuf,
    database_path: PathBuf,
}

impl WorkspaceLayout {
    fn under(workspace_root: PathBuf) -> Self {
        Self {
            config_dir: workspace_root.join("config"),
            logs_dir: workspace_root.join("logs"),
            database_path: workspace_root.join("state").join(DATABASE_FILE),
            workspace_root,
        }
    }

    /// Fills in whatever is missing; existing configs and rows are left alone.
    fn prepare(&self) -> Result<(), InfraError> {
        fs::create_dir_all(&self.config_dir)?;
        fs::create_dir_all(&self.logs_dir)?;
        if let Some(state_dir) = self.database_path.parent() {
            fs::create_dir_all(state_dir)?;
        }
        ensure_default_configs(&self.config_dir)?;
        initialize_database(&self.database_path)
    }
}

pub struct AppState {
    layout: WorkspaceLayout,
    log: Arc<CommandLog>,
    clock: Arc<Clock>,
    store: Arc<Store>,
    timer: Arc<TimerSessionService<SqliteTaskStorage>>,
    flusher: Arc<SyncFlushService<SqliteTaskStorage>>,
    sync_settings: SyncSettings,
    background_jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    pub async fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        Self::with_runtime(
            workspace_root,
            Arc::new(Clock::system()),
            Arc::new(ForegroundOnlyTimer),
        )
        .await
    }

    pub async fn with_runtime(
        workspace_root: PathBuf,
        clock: Arc<Clock>,
        background: Arc<dyn BackgroundTimer>,
    ) -> Result<Self, InfraError> {
        let layout = WorkspaceLayout::under(workspace_root);
        layout.prepare()?;
        let log = Arc::new(CommandLog::new(&layout.logs_dir));
        // Both readers reject configs with an unsupported schema.
        let bucketing = read_bucketing(&layout.config_dir)?;
        let sync_settings = read_sync_settings(&layout.config_dir)?;

        let storage = Arc::new(SqliteTaskStorage::new(&layout.database_path));
        let store = Arc::new(TaskStore::open(storage, Arc::clone(&clock), bucketing).await?);
        let timer = Arc::new(
            TimerSessionService::new(Arc::clone(&store), background, Arc::clone(&log))
                .with_tick_interval(sync_settings.tick_interval),
        );
        let flusher = Arc::new(
            SyncFlushService::new(Arc::clone(&store), Arc::clone(&log)).with_retry_policy(RetryPolicy {
                max_attempts: sync_settings.retry_max_attempts,
                base_delay_ms: sync_settings.retry_base_delay_ms,
            }),
        );

        log.info(
            "bootstrap",
            &format!(
                "workspace={} database={}",
                layout.workspace_root.display(),
                layout.database_path.display()
            ),
        );
        Ok(Self {
            layout,
            log,
            clock,
            store,
            timer,
            flusher,
            sync_settings,
            background_jobs: Mutex::new(Vec::new()),
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.layout.workspace_root
    }

    pub fn config_dir(&self) -> &Path {
        &self.layout.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.layout.database_path
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn timer(&self) -> &Arc<TimerSessionService<SqliteTaskStorage>> {
        &self.timer
    }

    pub fn flusher(&self) -> &Arc<SyncFlushService<SqliteTaskStorage>> {
        &self.flusher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    /// Starts the periodic flush if configured. Must run inside a tokio runtime.
    pub fn start_background_jobs(&self) -> Result<(), InfraError> {
        let Some(every) = self.sync_settings.flush_interval else {
            return Ok(());
        };
        let handle = self.flusher.spawn_periodic(every);
        self.push_job(handle)?;
        self.log_info(
            "background_jobs",
            &format!("periodic flush every {}s", every.as_secs()),
        );
        Ok(())
    }

    /// Routes wake signals from a background counter into timer ticks.
    pub fn attach_background_wakes(&self, wakes: broadcast::Receiver<BackgroundWake>) -> Result<(), InfraError> {
        let handle = self.timer.attach_wake_signals(wakes);
        self.push_job(handle)
    }

    fn push_job(&self, handle: JoinHandle<()>) -> Result<(), InfraError> {
        self.background_jobs
            .lock()
            .map_err(|error| InfraError::poisoned("background jobs", error))?
            .push(handle);
        Ok(())
    }

    fn abort_background_jobs(&self) {
        if let Ok(mut jobs) = self.background_jobs.lock() {
            for job in jobs.drain(..) {
                job.abort();
            }
        }
    }

    /// Stops background work and writes out whatever is still dirty.
    pub async fn shutdown(&self) -> Result<FlushReport, InfraError> {
        self.abort_background_jobs();
        if let Err(error) = self.timer.tick() {
            self.log_error("shutdown", &format!("final tick failed: {error}"));
        }
        self.flusher.flush(FlushTrigger::Manual).await
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        self.log_error(command, &error.to_string());
        error.to_string()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        self.log.info(command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        self.log.error(command, message);
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        self.abort_background_jobs();
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateTaskRequest {
    pub label: Option<String>,
    pub goal_seconds: Option<u64>,
    pub due: Option<String>,
    pub tag_ids: Option<Vec<i64>>,
    pub category_id: Option<i64>,
    pub clear_category: bool,
    pub recurrence: Option<Recurrence>,
    pub clear_recurrence: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StopTimerResponse {
    pub task: Option<Task>,
    pub timer: TimerSnapshot,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SwitchTimerResponse {
    pub stopped: Option<Task>,
    pub timer: TimerSnapshot,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppBackgroundedResponse {
    pub timer: TimerSnapshot,
    pub flush: FlushReport,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SettingsResponse {
    pub timezone: String,
    pub week_start: String,
    pub cache_cleared: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClockOverrideResponse {
    pub now: String,
    pub override_value: Option<String>,
}

pub fn create_task_impl(
    state: &AppState,
    label: String,
    goal_seconds: Option<u64>,
    due: String,
    tag_ids: Option<Vec<i64>>,
    category_id: Option<i64>,
    recurrence: Option<Recurrence>,
) -> Result<Task, InfraError> {
    let bucketing = state.store.bucketing()?;
    let task = state.store.create_task(NewTask {
        label,
        goal_seconds: goal_seconds.unwrap_or(0),
        due_at: parse_instant_input(&due, "due", &bucketing)?,
        tag_ids: tag_ids.unwrap_or_default(),
        category_id,
        recurrence,
    })?;

    state.log_info("create_task", &format!("created task_id={}", task.id));
    Ok(task)
}

pub async fn update_task_impl(
    state: &AppState,
    task_id: i64,
    request: UpdateTaskRequest,
) -> Result<Task, InfraError> {
    let bucketing = state.store.bucketing()?;
    let due_at = request
        .due
        .as_deref()
        .map(|value| parse_instant_input(value, "due", &bucketing))
        .transpose()?;
    let patch = TaskPatch {
        label: request.label,
        goal_seconds: request.goal_seconds,
        due_at,
        tag_ids: request.tag_ids,
        category_id: if request.clear_category {
            Some(None)
        } else {
            request.category_id.map(Some)
        },
        recurrence: if request.clear_recurrence {
            Some(None)
        } else {
            request.recurrence.map(Some)
        },
    };

    let task = state.store.update_task(TaskId(task_id), &patch).await?;
    state.log_info("update_task", &format!("updated task_id={}", task.id));
    Ok(task)
}

pub async fn delete_task_impl(state: &AppState, task_id: i64) -> Result<bool, InfraError> {
    let task_id = TaskId(task_id);
    if state.timer.running_task()? == Some(task_id) {
        state.timer.stop()?;
    }

    let deleted = state.store.delete_task(task_id).await?;
    if deleted {
        state.log_info("delete_task", &format!("deleted task_id={task_id}"));
    }
    Ok(deleted)
}

pub async fn load_day_impl(state: &AppState, date: String) -> Result<Vec<Task>, InfraError> {
    let date = parse_date(&date, "date").map_err(InfraError::InvalidConfig)?;
    state.store.load_day(date).await
}

/// Tasks for the current local date according to the (possibly overridden) clock.
pub async fn load_today_impl(state: &AppState) -> Result<Vec<Task>, InfraError> {
    let bucketing = state.store.bucketing()?;
    let today: NaiveDate = bucketing.local_date(state.clock.now());
    state.store.load_day(today).await
}

pub async fn start_timer_impl(state: &AppState, task_id: i64) -> Result<TimerSnapshot, InfraError> {
    let session = state.timer.start(TaskId(task_id)).await?;
    state.log_info(
        "start_timer",
        &format!(
            "task_id={} accumulated_before={}",
            session.task_id, session.accumulated_before
        ),
    );
    state.timer.snapshot()
}

pub async fn switch_timer_impl(state: &AppState, task_id: i64) -> Result<SwitchTimerResponse, InfraError> {
    let outcome = state.timer.switch(TaskId(task_id)).await?;
    state.log_info(
        "switch_timer",
        &format!(
            "from={} to={}",
            outcome
                .stopped
                .as_ref()
                .map(|task| task.id.to_string())
                .unwrap_or_else(|| "none".to_string()),
            outcome.started.task_id
        ),
    );
    Ok(SwitchTimerResponse {
        stopped: outcome.stopped,
        timer: state.timer.snapshot()?,
    })
}

pub fn stop_timer_impl(state: &AppState) -> Result<StopTimerResponse, InfraError> {
    let task = state.timer.stop()?;
    if let Some(task) = &task {
        state.log_info(
            "stop_timer",
            &format!("task_id={} spent_seconds={}", task.id, task.spent_seconds),
        );
    }
    Ok(StopTimerResponse {
        task,
        timer: state.timer.snapshot()?,
    })
}

pub fn get_timer_state_impl(state: &AppState) -> Result<TimerSnapshot, InfraError> {
    state.timer.snapshot()
}

/// Pull-to-refresh style flush. Storage failures are reported, not raised.
pub async fn flush_impl(state: &AppState) -> Result<FlushReport, InfraError> {
    state.flusher.flush(FlushTrigger::Manual).await
}

pub async fn app_backgrounded_impl(state: &AppState) -> Result<AppBackgroundedResponse, InfraError> {
    if let Err(error) = state.timer.tick() {
        state.log_error("app_backgrounded", &format!("final tick failed: {error}"));
    }
    let flush = state.flusher.flush(FlushTrigger::Backgrounded).await?;
    Ok(AppBackgroundedResponse {
        timer: state.timer.snapshot()?,
        flush,
    })
}

/// Catches the running task up with the time spent suspended.
pub fn app_foregrounded_impl(state: &AppState) -> Result<TimerSnapshot, InfraError> {
    state.timer.tick()?;
    state.timer.snapshot()
}

pub fn update_settings_impl(
    state: &AppState,
    timezone: Option<String>,
    week_start: Option<String>,
) -> Result<SettingsResponse, InfraError> {
    let current = state.store.bucketing()?;
    let next = DayBucketing::new(
        timezone
            .as_deref()
            .map(parse_timezone)
            .transpose()?
            .unwrap_or(current.timezone),
        week_start
            .as_deref()
            .map(parse_week_start)
            .transpose()?
            .unwrap_or(current.week_start),
    );

    save_bucketing(state.config_dir(), &next)?;
    let cache_cleared = state.store.reconfigure(next)?;
    state.log_info(
        "update_settings",
        &format!(
            "timezone={} week_start={} cache_cleared={cache_cleared}",
            next.timezone.name(),
            weekday_name(next.week_start)
        ),
    );
    Ok(SettingsResponse {
        timezone: next.timezone.name().to_string(),
        week_start: weekday_name(next.week_start).to_string(),
        cache_cleared,
    })
}

pub fn set_clock_override_impl(state: &AppState, value: String) -> Result<ClockOverrideResponse, InfraError> {
    let bucketing = state.store.bucketing()?;
    let instant = parse_instant_input(&value, "value", &bucketing)?;
    state.timer.shift_clock(|clock| clock.set_override(instant))?;
    state.log_info("set_clock_override", &format!("value={}", format_instant(instant)));
    Ok(clock_response(&state.clock))
}

pub fn clear_clock_override_impl(state: &AppState) -> Result<ClockOverrideResponse, InfraError> {
    if state.timer.shift_clock(Clock::clear_override)?.is_some() {
        state.log_info("clear_clock_override", "override cleared");
    }
    Ok(clock_response(&state.clock))
}

fn clock_response(clock: &Clock) -> ClockOverrideResponse {
    ClockOverrideResponse {
        now: format_instant(clock.now()),
        override_value: clock
            .current_override()
            .map(|current| format_instant(current.value)),
    }
}

fn format_instant(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// RFC3339 instant, or a bare `YYYY-MM-DD` meaning local midnight of that date.
fn parse_instant_input(value: &str, field_name: &str, bucketing: &DayBucketing) -> Result<DateTime<Utc>, InfraError> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(bucketing.start_of_day(date));
    }
    Err(InfraError::InvalidConfig(format!(
        "{field_name} must be RFC3339 or YYYY-MM-DD"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::timer::TimerStatus;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    struct TempWorkspace {
        path: PathBuf,
    }

    impl TempWorkspace {
        fn new() -> Self {
            let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "daytally-command-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&path).expect("create temp workspace");
            Self { path }
        }

        async fn app_state(&self) -> AppState {
            AppState::new(self.path.clone())
                .await
                .expect("initialize app state")
        }

        async fn app_state_with_clock(&self, clock: Arc<Clock>) -> AppState {
            AppState::with_runtime(self.path.clone(), clock, Arc::new(ForegroundOnlyTimer))
                .await
                .expect("initialize app state")
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    struct ManualClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        fn starting_at(value: &str) -> Self {
            let now = DateTime::parse_from_rfc3339(value)
                .expect("valid datetime")
                .with_timezone(&Utc);
            Self {
                now: Arc::new(Mutex::new(now)),
            }
        }

        fn clock(&self) -> Arc<Clock> {
            let now = Arc::clone(&self.now);
            Arc::new(Clock::with_now_provider(Arc::new(move || {
                *now.lock().expect("manual clock lock")
            })))
        }

        fn advance(&self, seconds: i64) {
            let mut now = self.now.lock().expect("manual clock lock");
            *now += ChronoDuration::seconds(seconds);
        }
    }

    fn create(state: &AppState, label: &str, due: &str) -> Task {
        create_task_impl(state, label.to_string(), Some(1800), due.to_string(), None, None, None)
            .expect("create task")
    }

    #[tokio::test]
    async fn startup_lays_out_workspace_and_reopens_cleanly() {
        let workspace = TempWorkspace::new();
        {
            let state = workspace.app_state().await;
            assert!(state.config_dir().join("app.json").exists());
            assert!(state.config_dir().join("sync.json").exists());
            assert!(workspace.path.join("logs").is_dir());
            assert_eq!(
                state.database_path(),
                workspace.path.join("state").join("daytally.sqlite").as_path()
            );
            assert!(state.database_path().exists());
        }

        let reopened = workspace.app_state().await;
        assert_eq!(reopened.workspace_root(), workspace.path.as_path());
    }

    #[tokio::test]
    async fn startup_rejects_unsupported_config_schema() {
        let workspace = TempWorkspace::new();
        drop(workspace.app_state().await);
        fs::write(
            workspace.path.join("config").join("sync.json"),
            "{\"schema\": 2}\n",
        )
        .expect("overwrite sync config");

        let result = AppState::new(workspace.path.clone()).await;
        assert!(matches!(result, Err(InfraError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn create_task_rejects_empty_label() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state().await;
        let result = create_task_impl(&state, "   ".to_string(), None, "2024-03-10".to_string(), None, None, None);
        assert!(matches!(result, Err(InfraError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn create_task_rejects_malformed_due() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state().await;
        let result = create_task_impl(&state, "Task".to_string(), None, "next tuesday".to_string(), None, None, None);
        assert!(matches!(result, Err(InfraError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn empty_day_then_create_and_flush() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state().await;

        assert!(load_day_impl(&state, "2024-03-10".to_string()).await.expect("empty day").is_empty());
        let created = create(&state, "Write report", "2024-03-10");
        let report = flush_impl(&state).await.expect("flush");
        assert_eq!(report.persisted, vec![created.id]);

        let day = load_day_impl(&state, "2024-03-10".to_string()).await.expect("day");
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].id, created.id);
    }

    #[tokio::test]
    async fn persisted_tasks_survive_restart() {
        let workspace = TempWorkspace::new();
        let first_id = {
            let state = workspace.app_state().await;
            let created = create(&state, "Durable", "2024-03-10T09:00:00Z");
            flush_impl(&state).await.expect("flush");
            created.id
        };

        let state = workspace.app_state().await;
        let day = load_day_impl(&state, "2024-03-10".to_string()).await.expect("day");
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].label, "Durable");

        let next = create(&state, "Next", "2024-03-10");
        assert!(next.id > first_id);
    }

    #[tokio::test]
    async fn unflushed_changes_are_lost_on_restart() {
        let workspace = TempWorkspace::new();
        {
            let state = workspace.app_state().await;
            create(&state, "Ephemeral", "2024-03-10");
        }
        let state = workspace.app_state().await;
        assert!(load_day_impl(&state, "2024-03-10".to_string()).await.expect("day").is_empty());
    }

    #[tokio::test]
    async fn timer_flow_persists_spent_on_background() {
        let workspace = TempWorkspace::new();
        let manual = ManualClock::starting_at("2024-03-10T09:00:00Z");
        let state = workspace.app_state_with_clock(manual.clock()).await;
        let task = create(&state, "Focus", "2024-03-10");

        let timer = start_timer_impl(&state, task.id.0).await.expect("start");
        assert_eq!(timer.status, TimerStatus::Running);

        manual.advance(90);
        let backgrounded = app_backgrounded_impl(&state).await.expect("background");
        assert_eq!(backgrounded.flush.persisted, vec![task.id]);
        assert_eq!(backgrounded.timer.elapsed_seconds, 90);

        manual.advance(30);
        let foregrounded = app_foregrounded_impl(&state).expect("foreground");
        assert_eq!(foregrounded.elapsed_seconds, 120);

        let stopped = stop_timer_impl(&state).expect("stop");
        assert_eq!(stopped.task.expect("stopped task").spent_seconds, 120);
        assert_eq!(stopped.timer.status, TimerStatus::Idle);

        flush_impl(&state).await.expect("flush");
        let day = load_day_impl(&state, "2024-03-10".to_string()).await.expect("day");
        assert_eq!(day[0].spent_seconds, 120);
    }

    #[tokio::test]
    async fn deleting_running_task_stops_timer() {
        let workspace = TempWorkspace::new();
        let manual = ManualClock::starting_at("2024-03-10T09:00:00Z");
        let state = workspace.app_state_with_clock(manual.clock()).await;
        let task = create(&state, "Doomed", "2024-03-10");

        start_timer_impl(&state, task.id.0).await.expect("start");
        manual.advance(10);
        assert!(delete_task_impl(&state, task.id.0).await.expect("delete"));
        assert_eq!(get_timer_state_impl(&state).expect("timer").status, TimerStatus::Idle);
        assert!(load_day_impl(&state, "2024-03-10".to_string()).await.expect("day").is_empty());
    }

    #[tokio::test]
    async fn switching_timer_moves_accounting() {
        let workspace = TempWorkspace::new();
        let manual = ManualClock::starting_at("2024-03-10T09:00:00Z");
        let state = workspace.app_state_with_clock(manual.clock()).await;
        let first = create(&state, "First", "2024-03-10");
        let second = create(&state, "Second", "2024-03-10");

        start_timer_impl(&state, first.id.0).await.expect("start");
        manual.advance(45);
        let switched = switch_timer_impl(&state, second.id.0).await.expect("switch");
        assert_eq!(switched.stopped.expect("stopped").spent_seconds, 45);
        assert_eq!(switched.timer.task_id, Some(second.id));

        let conflict = start_timer_impl(&state, first.id.0).await;
        assert!(matches!(conflict, Err(InfraError::AlreadyRunning { .. })));
    }

    #[tokio::test]
    async fn update_task_moves_due_date() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state().await;
        let task = create(&state, "Movable", "2024-03-10");
        flush_impl(&state).await.expect("flush");
        load_day_impl(&state, "2024-03-10".to_string()).await.expect("warm cache");

        let updated = update_task_impl(
            &state,
            task.id.0,
            UpdateTaskRequest {
                label: Some("  Moved  ".to_string()),
                due: Some("2024-03-11".to_string()),
                ..UpdateTaskRequest::default()
            },
        )
        .await
        .expect("update");
        assert_eq!(updated.label, "Moved");

        assert!(load_day_impl(&state, "2024-03-10".to_string()).await.expect("old").is_empty());
        assert_eq!(load_day_impl(&state, "2024-03-11".to_string()).await.expect("new").len(), 1);
    }

    #[tokio::test]
    async fn timezone_change_rebuckets_tasks() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state().await;
        create(&state, "Late night", "2024-03-10T23:30:00Z");
        flush_impl(&state).await.expect("flush");
        assert_eq!(load_day_impl(&state, "2024-03-10".to_string()).await.expect("utc").len(), 1);

        let settings = update_settings_impl(&state, Some("Asia/Tokyo".to_string()), None).expect("settings");
        assert!(settings.cache_cleared);
        assert_eq!(settings.timezone, "Asia/Tokyo");
        assert_eq!(settings.week_start, "monday");

        assert!(load_day_impl(&state, "2024-03-10".to_string()).await.expect("tokyo 10th").is_empty());
        assert_eq!(load_day_impl(&state, "2024-03-11".to_string()).await.expect("tokyo 11th").len(), 1);
        assert_eq!(
            read_bucketing(state.config_dir()).expect("saved bucketing").timezone,
            chrono_tz::Asia::Tokyo
        );
    }

    #[tokio::test]
    async fn unchanged_settings_keep_cache() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state().await;
        load_day_impl(&state, "2024-03-10".to_string()).await.expect("warm cache");
        let settings = update_settings_impl(&state, Some("UTC".to_string()), Some("Monday".to_string()))
            .expect("settings");
        assert!(!settings.cache_cleared);
        assert!(update_settings_impl(&state, Some("Nowhere/Special".to_string()), None).is_err());
    }

    #[tokio::test]
    async fn clock_override_drives_today() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state().await;
        let task = create(&state, "Simulated", "2024-03-10");

        let response = set_clock_override_impl(&state, "2024-03-10T12:00:00Z".to_string()).expect("override");
        assert_eq!(response.override_value.as_deref(), Some("2024-03-10T12:00:00Z"));
        assert!(response.now.starts_with("2024-03-10"));

        let today = load_today_impl(&state).await.expect("today");
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].id, task.id);

        let cleared = clear_clock_override_impl(&state).expect("clear");
        assert_eq!(cleared.override_value, None);
    }

    #[tokio::test]
    async fn clock_override_mid_session_never_reduces_spent() {
        let workspace = TempWorkspace::new();
        let manual = ManualClock::starting_at("2024-03-10T09:00:00Z");
        let state = workspace.app_state_with_clock(manual.clock()).await;
        let task = create(&state, "Time travel", "2024-03-10");
        let spent = |state: &AppState| {
            state
                .store()
                .cached_task(task.id)
                .expect("cached")
                .expect("exists")
                .spent_seconds
        };
        let running_total = |state: &AppState| {
            let timer = get_timer_state_impl(state).expect("timer");
            timer.accumulated_before_seconds + timer.elapsed_seconds
        };

        start_timer_impl(&state, task.id.0).await.expect("start");
        manual.advance(60);
        state.timer().tick().expect("tick");
        assert_eq!(spent(&state), 60);

        set_clock_override_impl(&state, "2024-03-09T09:01:00Z".to_string()).expect("override back");
        assert_eq!(spent(&state), 60);
        manual.advance(10);
        assert_eq!(running_total(&state), 70);

        clear_clock_override_impl(&state).expect("clear");
        assert_eq!(spent(&state), 70);
        assert_eq!(running_total(&state), 70);

        set_clock_override_impl(&state, "2024-03-13T09:00:00Z".to_string()).expect("override ahead");
        assert_eq!(spent(&state), 70);
        manual.advance(5);
        let stopped = stop_timer_impl(&state).expect("stop");
        assert_eq!(stopped.task.expect("stopped task").spent_seconds, 75);
    }

    #[tokio::test]
    async fn command_error_is_logged() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state().await;
        let error = load_day_impl(&state, "03/10/2024".to_string())
            .await
            .expect_err("invalid date");
        let message = state.command_error("load_day", &error);
        assert!(message.contains("YYYY-MM-DD"));

        let log = fs::read_to_string(workspace.path.join("logs").join("commands.log")).expect("read log");
        assert!(log.lines().any(|line| line.contains("\"load_day\"") && line.contains("\"error\"")));
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_changes() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state().await;
        state.start_background_jobs().expect("background jobs");
        let task = create(&state, "Last words", "2024-03-10");

        let report = state.shutdown().await.expect("shutdown");
        assert_eq!(report.persisted, vec![task.id]);
    }
}
