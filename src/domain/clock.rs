use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A shifted view of time: `value` was "now" at real instant `set_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockOverride {
    pub value: DateTime<Utc>,
    pub set_at: DateTime<Utc>,
}

impl ClockOverride {
    fn project(&self, real_now: DateTime<Utc>) -> DateTime<Utc> {
        self.value + (real_now - self.set_at)
    }
}

/// Virtual clock. An override shifts time but never pauses it: real time that
/// passes after `set_override` keeps accruing on top of the override value.
pub struct Clock {
    real_now: NowProvider,
    current_override: RwLock<Option<ClockOverride>>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl Clock {
    pub fn system() -> Self {
        Self::with_now_provider(Arc::new(Utc::now))
    }

    pub fn with_now_provider(real_now: NowProvider) -> Self {
        Self {
            real_now,
            current_override: RwLock::new(None),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        // Read the override once so a concurrent clear cannot split the computation.
        let current = *self
            .current_override
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let real_now = (self.real_now)();
        match current {
            Some(shift) => shift.project(real_now),
            None => real_now,
        }
    }

    pub fn real_now(&self) -> DateTime<Utc> {
        (self.real_now)()
    }

    pub fn set_override(&self, value: DateTime<Utc>) -> ClockOverride {
        let shift = ClockOverride {
            value,
            set_at: (self.real_now)(),
        };
        *self
            .current_override
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(shift);
        shift
    }

    pub fn clear_override(&self) -> Option<ClockOverride> {
        self.current_override
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn current_override(&self) -> Option<ClockOverride> {
        *self
            .current_override
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Clock")
            .field("current_override", &self.current_override())
            .finish_non_exhaustive()
    }
}
