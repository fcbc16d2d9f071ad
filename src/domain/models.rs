use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    Daily { every_days: u32 },
    /// An empty `weekdays` list repeats on the weekday of the due date.
    Weekly { every_weeks: u32, weekdays: Vec<Weekday> },
}

impl Recurrence {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Recurrence::Daily { every_days } if *every_days == 0 => {
                Err("recurrence.every_days must be > 0".to_string())
            }
            Recurrence::Weekly { every_weeks, .. } if *every_weeks == 0 => {
                Err("recurrence.every_weeks must be > 0".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub goal_seconds: u64,
    pub spent_seconds: u64,
    #[serde(default)]
    pub tag_ids: Vec<i64>,
    pub category_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
}

impl Task {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.label, "task.label")?;
        if self.id.0 <= 0 {
            return Err("task.id must be positive".to_string());
        }
        if let Some(recurrence) = &self.recurrence {
            recurrence.validate()?;
        }
        Ok(())
    }

    /// Negative once the goal is overrun.
    pub fn remaining_seconds(&self) -> i64 {
        saturating_i64(self.goal_seconds) - saturating_i64(self.spent_seconds)
    }

    pub fn is_overrun(&self) -> bool {
        self.goal_seconds > 0 && self.spent_seconds > self.goal_seconds
    }

    pub fn progress_ratio(&self) -> Option<f64> {
        if self.goal_seconds == 0 {
            return None;
        }
        Some(self.spent_seconds as f64 / self.goal_seconds as f64)
    }
}

/// Fields a caller supplies when creating a task; id and timestamps are assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTask {
    pub label: String,
    pub goal_seconds: u64,
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub tag_ids: Vec<i64>,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPatch {
    pub label: Option<String>,
    pub goal_seconds: Option<u64>,
    pub due_at: Option<DateTime<Utc>>,
    pub tag_ids: Option<Vec<i64>>,
    /// `Some(None)` clears the category.
    pub category_id: Option<Option<i64>>,
    /// `Some(None)` clears the recurrence.
    pub recurrence: Option<Option<Recurrence>>,
}

impl TaskPatch {
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(label) = &self.label {
            task.label = label.trim().to_string();
        }
        if let Some(goal_seconds) = self.goal_seconds {
            task.goal_seconds = goal_seconds;
        }
        if let Some(due_at) = self.due_at {
            task.due_at = due_at;
        }
        if let Some(tag_ids) = &self.tag_ids {
            task.tag_ids = tag_ids.clone();
        }
        if let Some(category_id) = self.category_id {
            task.category_id = category_id;
        }
        if let Some(recurrence) = &self.recurrence {
            task.recurrence = recurrence.clone();
        }
    }
}

/// Timezone and week-start convention used to place tasks into calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayBucketing {
    pub timezone: Tz,
    pub week_start: Weekday,
}

impl Default for DayBucketing {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            week_start: Weekday::Mon,
        }
    }
}

impl DayBucketing {
    pub fn new(timezone: Tz, week_start: Weekday) -> Self {
        Self {
            timezone,
            week_start,
        }
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.timezone).date_naive()
    }

    pub fn week_start_of(&self, date: NaiveDate) -> NaiveDate {
        let offset = (7 + date.weekday().num_days_from_monday()
            - self.week_start.num_days_from_monday())
            % 7;
        date - Duration::days(i64::from(offset))
    }

    /// First instant of `date` in the configured timezone. Midnight falling in a
    /// DST gap resolves to the first valid local time after it.
    pub fn start_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        let mut local = date.and_time(NaiveTime::MIN);
        for _ in 0..4 {
            if let Some(instant) = self.timezone.from_local_datetime(&local).earliest() {
                return instant.with_timezone(&Utc);
            }
            local += Duration::minutes(30);
        }
        Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
    }

    pub fn occurs_on(&self, task: &Task, date: NaiveDate) -> bool {
        let due = self.local_date(task.due_at);
        if date == due {
            return true;
        }
        let Some(recurrence) = &task.recurrence else {
            return false;
        };
        if date < due {
            return false;
        }

        match recurrence {
            Recurrence::Daily { every_days } => {
                (date - due).num_days() % i64::from((*every_days).max(1)) == 0
            }
            Recurrence::Weekly {
                every_weeks,
                weekdays,
            } => {
                let weekday_matches = if weekdays.is_empty() {
                    date.weekday() == due.weekday()
                } else {
                    weekdays.contains(&date.weekday())
                };
                if !weekday_matches {
                    return false;
                }
                let weeks = (self.week_start_of(date) - self.week_start_of(due)).num_days() / 7;
                weeks % i64::from((*every_weeks).max(1)) == 0
            }
        }
    }
}

pub fn parse_weekday(value: &str) -> Option<Weekday> {
    match value.trim().to_ascii_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

pub fn parse_date(value: &str, field_name: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| format!("{field_name} must be YYYY-MM-DD"))
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
