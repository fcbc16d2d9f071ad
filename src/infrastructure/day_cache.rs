use crate::domain::models::{DayBucketing, Task};
use crate::infrastructure::error::InfraError;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Ticket handed out before a storage query. A load may only populate the
/// cache if no invalidation happened while it was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    generation: u64,
    pub bucketing: DayBucketing,
}

#[derive(Debug, Default)]
struct DayCacheState {
    days: HashMap<NaiveDate, Vec<Task>>,
    generation: u64,
    bucketing: DayBucketing,
}

#[derive(Debug, Default)]
pub struct DayCache {
    state: Mutex<DayCacheState>,
}

impl DayCache {
    pub fn new(bucketing: DayBucketing) -> Self {
        Self {
            state: Mutex::new(DayCacheState {
                bucketing,
                ..DayCacheState::default()
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, DayCacheState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::poisoned("day cache", error))
    }

    pub fn bucketing(&self) -> Result<DayBucketing, InfraError> {
        Ok(self.lock()?.bucketing)
    }

    pub fn get(&self, date: NaiveDate) -> Result<Option<Vec<Task>>, InfraError> {
        Ok(self.lock()?.days.get(&date).cloned())
    }

    pub fn begin_load(&self) -> Result<LoadTicket, InfraError> {
        let state = self.lock()?;
        Ok(LoadTicket {
            generation: state.generation,
            bucketing: state.bucketing,
        })
    }

    /// Returns false when the ticket went stale and the rows were dropped.
    pub fn store(&self, date: NaiveDate, ticket: LoadTicket, tasks: Vec<Task>) -> Result<bool, InfraError> {
        let mut state = self.lock()?;
        if state.generation != ticket.generation {
            return Ok(false);
        }
        state.days.insert(date, tasks);
        Ok(true)
    }

    pub fn invalidate_date(&self, date: NaiveDate) -> Result<bool, InfraError> {
        let mut state = self.lock()?;
        state.generation = state.generation.wrapping_add(1);
        Ok(state.days.remove(&date).is_some())
    }

    /// Drops every cached day `task` belongs to, before or after a change.
    /// Returns the dates that were evicted.
    pub fn invalidate_task(&self, task: &Task, previous: Option<&Task>) -> Result<Vec<NaiveDate>, InfraError> {
        let mut state = self.lock()?;
        state.generation = state.generation.wrapping_add(1);
        let bucketing = state.bucketing;

        let mut evicted = state
            .days
            .iter()
            .filter(|(date, tasks)| {
                bucketing.occurs_on(task, **date)
                    || previous.is_some_and(|previous| bucketing.occurs_on(previous, **date))
                    || tasks.iter().any(|cached| cached.id == task.id)
            })
            .map(|(date, _)| *date)
            .collect::<Vec<_>>();
        evicted.sort();
        for date in &evicted {
            state.days.remove(date);
        }
        Ok(evicted)
    }

    /// Switching timezone or week start changes which day every task falls on.
    pub fn reconfigure(&self, bucketing: DayBucketing) -> Result<bool, InfraError> {
        let mut state = self.lock()?;
        if state.bucketing == bucketing {
            return Ok(false);
        }
        state.bucketing = bucketing;
        state.generation = state.generation.wrapping_add(1);
        state.days.clear();
        Ok(true)
    }

    pub fn clear(&self) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state.generation = state.generation.wrapping_add(1);
        state.days.clear();
        Ok(())
    }

    pub fn cached_dates(&self) -> Result<Vec<NaiveDate>, InfraError> {
        let mut dates = self.lock()?.days.keys().copied().collect::<Vec<_>>();
        dates.sort();
        Ok(dates)
    }
}
