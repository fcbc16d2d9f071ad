use crate::domain::models::{Task, TaskId};
use crate::infrastructure::error::InfraError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtyMutation {
    Upsert(Task),
    Delete(Task),
}

impl DirtyMutation {
    pub fn task(&self) -> &Task {
        match self {
            DirtyMutation::Upsert(task) | DirtyMutation::Delete(task) => task,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task().id
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, DirtyMutation::Delete(_))
    }
}

/// Entries captured by one `drain`. They stay visible through `latest`/`pending`
/// until the batch is settled.
#[derive(Debug, Clone)]
pub struct DrainedBatch {
    pub id: u64,
    pub entries: Vec<DirtyMutation>,
}

impl DrainedBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
struct InFlightBatch {
    id: u64,
    entries: HashMap<TaskId, DirtyMutation>,
}

#[derive(Debug, Default)]
struct BufferState {
    pending: HashMap<TaskId, DirtyMutation>,
    in_flight: Option<InFlightBatch>,
    next_batch_id: u64,
}

/// Task mutations not yet durably persisted. Last write wins per task.
#[derive(Debug, Default)]
pub struct DirtyBuffer {
    state: Mutex<BufferState>,
}

impl DirtyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BufferState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::poisoned("dirty buffer", error))
    }

    pub fn mark_dirty(&self, mutation: DirtyMutation) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state.pending.insert(mutation.task_id(), mutation);
        Ok(())
    }

    /// Moves every pending entry into a new in-flight batch. Marks that arrive
    /// afterwards land in the fresh pending map and are picked up by the next
    /// drain. Only one batch may be outstanding at a time.
    pub fn drain(&self) -> Result<DrainedBatch, InfraError> {
        let mut state = self.lock()?;
        if state.in_flight.is_some() {
            return Err(InfraError::DrainInProgress);
        }

        state.next_batch_id = state.next_batch_id.wrapping_add(1);
        let id = state.next_batch_id;
        let captured = std::mem::take(&mut state.pending);
        let mut entries = captured.values().cloned().collect::<Vec<_>>();
        entries.sort_by_key(DirtyMutation::task_id);
        state.in_flight = Some(InFlightBatch {
            id,
            entries: captured,
        });

        Ok(DrainedBatch { id, entries })
    }

    /// Closes batch `batch_id`. Entries not listed in `persisted` go back to
    /// pending unless a newer mutation for the same task arrived meanwhile.
    /// Returns the ids that were requeued.
    pub fn settle(&self, batch_id: u64, persisted: &[TaskId]) -> Result<Vec<TaskId>, InfraError> {
        let mut state = self.lock()?;
        let in_flight = match state.in_flight.take() {
            Some(batch) if batch.id == batch_id => batch,
            other => {
                state.in_flight = other;
                return Err(InfraError::InvalidConfig(format!(
                    "batch {batch_id} is not the outstanding drain"
                )));
            }
        };

        let mut requeued = Vec::new();
        for (task_id, mutation) in in_flight.entries {
            if persisted.contains(&task_id) {
                continue;
            }
            if let std::collections::hash_map::Entry::Vacant(slot) = state.pending.entry(task_id) {
                slot.insert(mutation);
                requeued.push(task_id);
            }
        }
        requeued.sort();
        Ok(requeued)
    }

    /// Returns a batch whose persistence never completed, requeueing all of it.
    pub fn abandon(&self, batch_id: u64) -> Result<Vec<TaskId>, InfraError> {
        self.settle(batch_id, &[])
    }

    pub fn is_dirty(&self, task_id: TaskId) -> Result<bool, InfraError> {
        let state = self.lock()?;
        Ok(state.pending.contains_key(&task_id)
            || state
                .in_flight
                .as_ref()
                .is_some_and(|batch| batch.entries.contains_key(&task_id)))
    }

    /// Newest unpersisted mutation for `task_id`, pending before in-flight.
    pub fn latest(&self, task_id: TaskId) -> Result<Option<DirtyMutation>, InfraError> {
        let state = self.lock()?;
        if let Some(mutation) = state.pending.get(&task_id) {
            return Ok(Some(mutation.clone()));
        }
        Ok(state
            .in_flight
            .as_ref()
            .and_then(|batch| batch.entries.get(&task_id))
            .cloned())
    }

    /// Every unpersisted mutation, one per task, newest wins.
    pub fn unpersisted(&self) -> Result<Vec<DirtyMutation>, InfraError> {
        let state = self.lock()?;
        let mut merged = state
            .in_flight
            .as_ref()
            .map(|batch| batch.entries.clone())
            .unwrap_or_default();
        for (task_id, mutation) in &state.pending {
            merged.insert(*task_id, mutation.clone());
        }
        let mut mutations = merged.into_values().collect::<Vec<_>>();
        mutations.sort_by_key(DirtyMutation::task_id);
        Ok(mutations)
    }

    pub fn pending_len(&self) -> Result<usize, InfraError> {
        Ok(self.lock()?.pending.len())
    }

    pub fn has_outstanding_drain(&self) -> Result<bool, InfraError> {
        Ok(self.lock()?.in_flight.is_some())
    }
}
