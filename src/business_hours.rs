use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::models::flow::MessageKind;
use crate::tickets::DistributionMode;

/// Business-hours and handoff messaging configuration of one support queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueBusinessHoursConfig {
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub hours: Option<HashMap<String, Vec<TimeWindow>>>,
    #[serde(default)]
    pub holidays: Vec<String>,
    #[serde(default)]
    pub exceptions: HashMap<String, Vec<TimeWindow>>,
    #[serde(default)]
    pub pre_human: Option<PreHumanConfig>,
    #[serde(default)]
    pub off_hours: Option<OffHoursConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
}

impl TimeWindow {
    fn bounds(&self) -> Option<(u32, u32)> {
        Some((to_minutes(&self.start)?, to_minutes(&self.end)?))
    }
}

/// A configured message: either plain text or a typed unified message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfiguredMessage {
    Text(String),
    Rich {
        #[serde(rename = "type", default)]
        kind: MessageKind,
        content: Value,
    },
}

impl ConfiguredMessage {
    pub fn parts(&self) -> (MessageKind, Value) {
        match self {
            ConfiguredMessage::Text(text) => (MessageKind::Text, Value::String(text.clone())),
            ConfiguredMessage::Rich { kind, content } => (*kind, content.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreHumanConfig {
    #[serde(default)]
    pub message: Option<ConfiguredMessage>,
    #[serde(default)]
    pub delay_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OffHoursConfig {
    #[serde(default)]
    pub message: Option<ConfiguredMessage>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub holiday: Option<OffHoursVariant>,
    #[serde(default)]
    pub closed: Option<OffHoursVariant>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OffHoursVariant {
    #[serde(default)]
    pub message: Option<ConfiguredMessage>,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedReason {
    Holiday,
    Exception,
    OutsideHours,
}

impl ClosedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ClosedReason::Holiday => "holiday",
            ClosedReason::Exception => "exception",
            ClosedReason::OutsideHours => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Open,
    Closed(ClosedReason),
}

impl Availability {
    pub fn is_open(self) -> bool {
        matches!(self, Availability::Open)
    }
}

/// Decides whether a queue is open at `now`.
///
/// Order: a per-date exception wins outright (empty means closed all day),
/// then holidays, then the weekday schedule. Window bounds are inclusive.
/// Dates are taken in UTC when no timezone is set; without weekday hours the
/// queue is open on any day that is not an exception or a holiday.
pub fn evaluate(config: &QueueBusinessHoursConfig, now: DateTime<Utc>) -> Availability {
    let tz = config.timezone.as_deref().map(parse_timezone).unwrap_or(Tz::UTC);
    let local = now.with_timezone(&tz);
    let minute = local.hour() * 60 + local.minute();
    let date = local.date_naive();

    if let Some(windows) = config.exceptions.get(&date.format("%Y-%m-%d").to_string()) {
        return if within(windows, minute) {
            Availability::Open
        } else {
            Availability::Closed(ClosedReason::Exception)
        };
    }

    if is_holiday(&config.holidays, date) {
        return Availability::Closed(ClosedReason::Holiday);
    }

    let Some(hours) = config.hours.as_ref().filter(|h| !h.is_empty()) else {
        return Availability::Open;
    };
    let windows = weekday_windows(hours, local.weekday());
    if within(windows, minute) {
        Availability::Open
    } else {
        Availability::Closed(ClosedReason::OutsideHours)
    }
}

pub fn parse_timezone(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        warn!(timezone = name, "Unknown timezone in business hours, using UTC");
        Tz::UTC
    })
}

fn within(windows: &[TimeWindow], minute: u32) -> bool {
    windows.iter().filter_map(TimeWindow::bounds).any(|(start, end)| {
        if start <= end {
            minute >= start && minute <= end
        } else {
            // Window crossing midnight (e.g. 22:00-06:00)
            minute >= start || minute <= end
        }
    })
}

fn weekday_windows(hours: &HashMap<String, Vec<TimeWindow>>, day: Weekday) -> &[TimeWindow] {
    let short = match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    };
    let long = day_name(day);
    let numeric = day.num_days_from_sunday().to_string();

    hours
        .iter()
        .find(|(k, _)| {
            let k = k.trim().to_lowercase();
            k == short || k == long || k == numeric
        })
        .map(|(_, v)| v.as_slice())
        .unwrap_or(&[])
}

fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// `YYYY-MM-DD` matches one date; `MM-DD` matches every year.
fn is_holiday(holidays: &[String], date: NaiveDate) -> bool {
    let full = date.format("%Y-%m-%d").to_string();
    let recurring = date.format("%m-%d").to_string();
    holidays.iter().map(|h| h.trim()).any(|h| h == full || h == recurring)
}

fn to_minutes(time_str: &str) -> Option<u32> {
    let (h, m) = time_str.trim().split_once(':')?;
    let (h, m) = (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?);
    (h <= 24 && m < 60).then_some(h * 60 + m)
}

/// Source of slow-changing queue settings.
#[async_trait]
pub trait QueueSettingsSource: Send + Sync {
    async fn business_hours(&self, queue: &str) -> Result<Option<QueueBusinessHoursConfig>>;

    async fn distribution_mode(&self) -> Result<DistributionMode>;
}

pub struct PgQueueSettings {
    pool: PgPool,
}

impl PgQueueSettings {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueSettingsSource for PgQueueSettings {
    async fn business_hours(&self, queue: &str) -> Result<Option<QueueBusinessHoursConfig>> {
        let raw: Option<Value> = sqlx::query_scalar(
            r#"SELECT business_hours FROM queue_settings WHERE lower(queue_name) = lower($1)"#,
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch queue business hours")?;

        match raw {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .context("Malformed business hours config"),
            None => Ok(None),
        }
    }

    async fn distribution_mode(&self) -> Result<DistributionMode> {
        let raw: Option<String> =
            sqlx::query_scalar(r#"SELECT value FROM settings WHERE key = 'distribution_mode'"#)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch distribution mode")?;
        Ok(raw.as_deref().map(DistributionMode::parse).unwrap_or_default())
    }
}

/// Static settings, used by tests and by deployments without a settings table.
#[derive(Default)]
pub struct StaticQueueSettings {
    pub queues: HashMap<String, QueueBusinessHoursConfig>,
    pub mode: DistributionMode,
}

#[async_trait]
impl QueueSettingsSource for StaticQueueSettings {
    async fn business_hours(&self, queue: &str) -> Result<Option<QueueBusinessHoursConfig>> {
        Ok(self.queues.get(queue).cloned())
    }

    async fn distribution_mode(&self) -> Result<DistributionMode> {
        Ok(self.mode)
    }
}

/// TTL cache over a [`QueueSettingsSource`] so each turn does not refetch
/// queue configuration.
pub struct QueueSettingsCache {
    source: Arc<dyn QueueSettingsSource>,
    ttl: Duration,
    hours: DashMap<String, (Instant, Option<QueueBusinessHoursConfig>)>,
    mode: Mutex<Option<(Instant, DistributionMode)>>,
}

impl QueueSettingsCache {
    pub fn new(source: Arc<dyn QueueSettingsSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            hours: DashMap::new(),
            mode: Mutex::new(None),
        }
    }

    pub async fn business_hours(&self, queue: &str) -> Result<Option<QueueBusinessHoursConfig>> {
        let key = queue.to_lowercase();
        if let Some(entry) = self.hours.get(&key) {
            if entry.0.elapsed() < self.ttl {
                return Ok(entry.1.clone());
            }
        }
        debug!(queue = queue, "Refreshing business hours config");
        let fresh = self.source.business_hours(queue).await?;
        self.hours.insert(key, (Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    pub async fn distribution_mode(&self) -> Result<DistributionMode> {
        let cached = *self.mode.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((at, mode)) = cached {
            if at.elapsed() < self.ttl {
                return Ok(mode);
            }
        }
        let fresh = self.source.distribution_mode().await?;
        *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = Some((Instant::now(), fresh));
        Ok(fresh)
    }

    pub fn invalidate(&self, queue: Option<&str>) {
        match queue {
            Some(q) => {
                self.hours.remove(&q.to_lowercase());
            }
            None => {
                self.hours.clear();
                *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = None;
            }
        }
    }
}
