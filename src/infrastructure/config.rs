use crate::domain::models::{parse_weekday, weekday_name, DayBucketing};
use crate::infrastructure::error::InfraError;
use chrono::Weekday;
use chrono_tz::Tz;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const SYNC_JSON: &str = "sync.json";
const DEFAULT_TIMEZONE: &str = "UTC";
const DEFAULT_WEEK_START: &str = "monday";
const DEFAULT_FLUSH_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_TICK_INTERVAL_SECONDS: u64 = 1;
const DEFAULT_RETRY_ATTEMPTS: u8 = 2;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// `None` disables the periodic flush.
    pub flush_interval: Option<Duration>,
    /// `None` disables the foreground ticker.
    pub tick_interval: Option<Duration>,
    pub retry_max_attempts: u8,
    pub retry_base_delay_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            flush_interval: Some(Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECONDS)),
            tick_interval: Some(Duration::from_secs(DEFAULT_TICK_INTERVAL_SECONDS)),
            retry_max_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "Daytally",
                "timezone": DEFAULT_TIMEZONE,
                "weekStart": DEFAULT_WEEK_START
            }),
        ),
        (
            SYNC_JSON,
            serde_json::json!({
                "schema": 1,
                "flushIntervalSeconds": DEFAULT_FLUSH_INTERVAL_SECONDS,
                "tickIntervalSeconds": DEFAULT_TICK_INTERVAL_SECONDS,
                "retry": {
                    "maxAttempts": DEFAULT_RETRY_ATTEMPTS,
                    "baseDelayMs": DEFAULT_RETRY_BASE_DELAY_MS
                }
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            write_config(&path, &value)?;
        }
    }
    Ok(())
}

fn write_config(path: &Path, value: &serde_json::Value) -> Result<(), InfraError> {
    let formatted = serde_json::to_string_pretty(value)?;
    fs::write(path, format!("{formatted}\n"))?;
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

fn string_field<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub fn parse_timezone(value: &str) -> Result<Tz, InfraError> {
    value
        .trim()
        .parse::<Tz>()
        .map_err(|error| InfraError::InvalidConfig(format!("unknown timezone '{value}': {error}")))
}

pub fn parse_week_start(value: &str) -> Result<Weekday, InfraError> {
    parse_weekday(value)
        .ok_or_else(|| InfraError::InvalidConfig(format!("unknown week start '{value}'")))
}

pub fn read_bucketing(config_dir: &Path) -> Result<DayBucketing, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    let timezone = parse_timezone(string_field(&app, "timezone").unwrap_or(DEFAULT_TIMEZONE))?;
    let week_start = parse_week_start(string_field(&app, "weekStart").unwrap_or(DEFAULT_WEEK_START))?;
    Ok(DayBucketing::new(timezone, week_start))
}

pub fn save_bucketing(config_dir: &Path, bucketing: &DayBucketing) -> Result<(), InfraError> {
    let path = config_dir.join(APP_JSON);
    let mut app = read_config(&path)?;
    let object = app.as_object_mut().ok_or_else(|| {
        InfraError::InvalidConfig(format!("invalid object structure in {}", path.display()))
    })?;
    object.insert(
        "timezone".to_string(),
        serde_json::Value::String(bucketing.timezone.name().to_string()),
    );
    object.insert(
        "weekStart".to_string(),
        serde_json::Value::String(weekday_name(bucketing.week_start).to_string()),
    );
    write_config(&path, &app)
}

fn interval_field(value: &serde_json::Value, key: &str, default_seconds: u64) -> Option<Duration> {
    let seconds = value
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(default_seconds);
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

pub fn read_sync_settings(config_dir: &Path) -> Result<SyncSettings, InfraError> {
    let sync = read_config(&config_dir.join(SYNC_JSON))?;
    let retry = sync.get("retry");
    let retry_max_attempts = retry
        .and_then(|retry| retry.get("maxAttempts"))
        .and_then(serde_json::Value::as_u64)
        .map(|value| u8::try_from(value).unwrap_or(u8::MAX))
        .unwrap_or(DEFAULT_RETRY_ATTEMPTS);
    let retry_base_delay_ms = retry
        .and_then(|retry| retry.get("baseDelayMs"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS);

    Ok(SyncSettings {
        flush_interval: interval_field(&sync, "flushIntervalSeconds", DEFAULT_FLUSH_INTERVAL_SECONDS),
        tick_interval: interval_field(&sync, "tickIntervalSeconds", DEFAULT_TICK_INTERVAL_SECONDS),
        retry_max_attempts,
        retry_base_delay_ms,
    })
}
