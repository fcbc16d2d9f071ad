use crate::application::store::TaskStore;
use crate::domain::events::FlushTrigger;
use crate::domain::models::TaskId;
use crate::infrastructure::command_log::CommandLog;
use crate::infrastructure::dirty_buffer::{DirtyBuffer, DirtyMutation};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::task_repository::TaskStorage;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration as TokioDuration};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FlushFailure {
    pub task_id: TaskId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FlushReport {
    pub trigger: FlushTrigger,
    pub persisted: Vec<TaskId>,
    pub requeued: Vec<TaskId>,
    pub failures: Vec<FlushFailure>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Requeues the drained batch if the flush future is dropped mid-write.
struct BatchGuard<'a> {
    buffer: &'a DirtyBuffer,
    batch_id: u64,
    armed: bool,
}

impl<'a> BatchGuard<'a> {
    fn new(buffer: &'a DirtyBuffer, batch_id: u64) -> Self {
        Self {
            buffer,
            batch_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.buffer.abandon(self.batch_id);
        }
    }
}

/// Moves dirty tasks into durable storage. One flush runs at a time; callers
/// that arrive while a flush is in progress wait for it and then flush
/// whatever was marked in the meantime.
pub struct SyncFlushService<S: TaskStorage> {
    store: Arc<TaskStore<S>>,
    log: Arc<CommandLog>,
    retry_policy: RetryPolicy,
    gate: AsyncMutex<()>,
}

impl<S: TaskStorage + 'static> SyncFlushService<S> {
    pub fn new(store: Arc<TaskStore<S>>, log: Arc<CommandLog>) -> Self {
        Self {
            store,
            log,
            retry_policy: RetryPolicy::default(),
            gate: AsyncMutex::new(()),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Persists every dirty task. Entries that still fail after retrying are
    /// requeued and reported, never surfaced as an error.
    pub async fn flush(&self, trigger: FlushTrigger) -> Result<FlushReport, InfraError> {
        let _gate = self.gate.lock().await;
        let buffer = self.store.dirty_buffer();
        let batch = buffer.drain()?;
        let mut guard = BatchGuard::new(buffer, batch.id);

        let mut persisted = Vec::with_capacity(batch.entries.len());
        let mut failures = Vec::new();
        for mutation in &batch.entries {
            match self.persist_with_retry(mutation).await {
                Ok(()) => persisted.push(mutation.task_id()),
                Err(error) => {
                    self.log.error(
                        "flush",
                        &format!("trigger={} task_id={} {error}", trigger.as_str(), mutation.task_id()),
                    );
                    failures.push(FlushFailure {
                        task_id: mutation.task_id(),
                        reason: error.to_string(),
                    });
                }
            }
        }

        let requeued = self.store.complete_flush(&batch, &persisted, trigger)?;
        guard.disarm();

        if !batch.is_empty() {
            self.log.info(
                "flush",
                &format!(
                    "trigger={} persisted={} requeued={}",
                    trigger.as_str(),
                    persisted.len(),
                    requeued.len()
                ),
            );
        }
        Ok(FlushReport {
            trigger,
            persisted,
            requeued,
            failures,
        })
    }

    async fn persist_with_retry(&self, mutation: &DirtyMutation) -> Result<(), InfraError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            let result = match mutation {
                DirtyMutation::Upsert(task) => self.store.storage().persist(task).await,
                DirtyMutation::Delete(task) => self.store.storage().remove(task.id).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(error) if self.should_retry(&error) && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt as u32));
                    sleep(TokioDuration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn should_retry(&self, error: &InfraError) -> bool {
        matches!(
            error,
            InfraError::Io(_) | InfraError::Sqlite(_) | InfraError::PersistenceFailure { .. }
        )
    }

    /// Flushes on a fixed cadence until the service is dropped or the handle aborted.
    pub fn spawn_periodic(self: &Arc<Self>, every: TokioDuration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                if let Err(error) = service.flush(FlushTrigger::Periodic).await {
                    service.log.error("flush", &format!("trigger=periodic {error}"));
                }
            }
        })
    }
}
