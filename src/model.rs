use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use derive_new::new;
use serde::{Deserialize, Serialize};
use serde::de::Visitor;

use crate::error::{ParseOccurrenceError, ScheduleError};


/// Duration value meaning "no end date".
pub const INDEFINITE_DURATION: i64 = -1;

pub(crate) const OCCURRENCE_TIME_FORMAT: &'static str = "%Y-%m-%dT%H:%M";


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimeOfDay(NaiveTime);

#[derive(Clone, Debug, Deserialize, Eq, Hash, new, PartialEq, Serialize)]
pub struct Config {
    pub data_path: String,
    pub log_path: String,
    pub user_id: String,
    #[serde(default = "Config::default_reminder_horizon_hours")]
    pub reminder_horizon_hours: i64,
    #[serde(default = "Config::default_early_window_minutes")]
    pub early_window_minutes: i64,
    #[serde(default = "Config::default_collaborator_timeout_ms")]
    pub collaborator_timeout_ms: u64,
    #[serde(default = "Config::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub log_dir: Option<String>,
}

/// Tunables the engine runs with; see [`Config::settings`].
#[derive(Clone, Copy, Debug, Eq, Hash, new, PartialEq)]
pub struct EngineSettings {
    pub reminder_horizon: Duration,
    pub early_window: Duration,
    pub collaborator_timeout: StdDuration,
    pub retry_backoff: StdDuration,
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, new, PartialEq, Serialize)]
pub struct Medication {
    id: String,
    user_id: String,
    name: String,
    dosage: String,
    times: Vec<TimeOfDay>,
    start_date: NaiveDate,
    duration_days: i64,
    active: bool,
    reminders_enabled: bool,
    color: String,
    current_supply: u32,
    total_supply: u32,
    refill_threshold: u8,
    #[serde(default)]
    last_refill_date: Option<NaiveDateTime>,
}

/// Changes written back to the medication store.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct MedicationPatch {
    pub current_supply: Option<u32>,
    pub last_refill_date: Option<NaiveDateTime>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CourseLength {
    Days(u32),
    Indefinite,
}

/// A single scheduled dose; its identity is the (medication, time) pair.
#[derive(Clone, Debug, Deserialize, Eq, Hash, new, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Occurrence {
    medication_id: String,
    scheduled: NaiveDateTime,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Timing {
    Early,
    OnTime,
    Late,
}

/// Immutable record of a taken dose.
#[derive(Clone, Debug, Deserialize, Eq, Hash, new, PartialEq, Serialize)]
pub struct DoseEvent {
    medication_id: String,
    scheduled: NaiveDateTime,
    confirmed_at: NaiveDateTime,
    timing: Timing,
}


impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Option<TimeOfDay> {
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(TimeOfDay)
    }

    pub fn time(&self) -> NaiveTime { self.0 }
}

impl From<NaiveTime> for TimeOfDay {
    fn from(t: NaiveTime) -> Self {
        TimeOfDay(t)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0.hour(), self.0.minute())
    }
}

impl FromStr for TimeOfDay {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveTime::parse_from_str(s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
            .map(TimeOfDay)
    }
}

impl Config {
    fn default_reminder_horizon_hours() -> i64 { 36 }
    fn default_early_window_minutes() -> i64 { 60 }
    fn default_collaborator_timeout_ms() -> u64 { 2000 }
    fn default_retry_backoff_ms() -> u64 { 500 }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings::new(
            Duration::hours(self.reminder_horizon_hours.max(0)),
            Duration::minutes(self.early_window_minutes.max(0)),
            StdDuration::from_millis(self.collaborator_timeout_ms),
            StdDuration::from_millis(self.retry_backoff_ms),
        )
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings::new(
            Duration::hours(Config::default_reminder_horizon_hours()),
            Duration::minutes(Config::default_early_window_minutes()),
            StdDuration::from_millis(Config::default_collaborator_timeout_ms()),
            StdDuration::from_millis(Config::default_retry_backoff_ms()),
        )
    }
}

impl Medication {
    pub fn id(&self) -> &str { &self.id }
    pub fn user_id(&self) -> &str { &self.user_id }
    pub fn name(&self) -> &str { &self.name }
    pub fn dosage(&self) -> &str { &self.dosage }
    pub fn times(&self) -> &Vec<TimeOfDay> { &self.times }
    pub fn start_date(&self) -> NaiveDate { self.start_date }
    pub fn duration_days(&self) -> i64 { self.duration_days }
    pub fn active(&self) -> bool { self.active }
    pub fn reminders_enabled(&self) -> bool { self.reminders_enabled }
    pub fn color(&self) -> &str { &self.color }
    pub fn current_supply(&self) -> u32 { self.current_supply }
    pub fn total_supply(&self) -> u32 { self.total_supply }
    pub fn refill_threshold(&self) -> u8 { self.refill_threshold }
    pub fn last_refill_date(&self) -> Option<NaiveDateTime> { self.last_refill_date }

    /// The times of day as an ordered set.
    pub fn schedule_times(&self) -> Vec<NaiveTime> {
        let mut times: Vec<NaiveTime> = self.times.iter()
            .map(|t| t.time())
            .collect();
        times.sort();
        times.dedup();
        times
    }

    pub fn doses_per_day(&self) -> u32 {
        self.schedule_times().len() as u32
    }

    pub fn course_length(&self) -> Result<CourseLength, ScheduleError> {
        match self.duration_days.cmp(&0) {
            Ordering::Less if self.duration_days == INDEFINITE_DURATION => Ok(CourseLength::Indefinite),
            Ordering::Less => Err(ScheduleError::InvalidSchedule {
                medication_id: self.id.clone(),
                reason: format!("negative duration {}", self.duration_days),
            }),
            _ => {
                let days = u32::try_from(self.duration_days)
                    .map_err(|_| ScheduleError::InvalidSchedule {
                        medication_id: self.id.clone(),
                        reason: format!("duration {} is too large", self.duration_days),
                    })?;
                Ok(CourseLength::Days(days))
            },
        }
    }

    /// Checks the parts of the record that the schedule depends on.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.course_length()?;
        if self.reminders_enabled && self.times.is_empty() {
            return Err(ScheduleError::InvalidSchedule {
                medication_id: self.id.clone(),
                reason: "no times of day while reminders are enabled".to_owned(),
            });
        }
        Ok(())
    }

    pub fn apply(&mut self, patch: &MedicationPatch) {
        if let Some(cs) = patch.current_supply {
            self.current_supply = cs;
        }
        if let Some(lrd) = patch.last_refill_date {
            self.last_refill_date = Some(lrd);
        }
    }
}

impl Occurrence {
    pub fn medication_id(&self) -> &str { &self.medication_id }
    pub fn scheduled(&self) -> NaiveDateTime { self.scheduled }
}

impl fmt::Display for Occurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.medication_id, self.scheduled.format(OCCURRENCE_TIME_FORMAT))
    }
}

impl FromStr for Occurrence {
    type Err = ParseOccurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // medication ids may contain '@', the time never does
        let (med_id, time_str) = s.rsplit_once('@')
            .ok_or(ParseOccurrenceError::MissingSeparator)?;
        if med_id.is_empty() {
            return Err(ParseOccurrenceError::MissingSeparator);
        }
        let scheduled = NaiveDateTime::parse_from_str(time_str, OCCURRENCE_TIME_FORMAT)
            .map_err(|_| ParseOccurrenceError::BadTime(time_str.to_owned()))?;
        Ok(Occurrence::new(med_id.to_owned(), scheduled))
    }
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timing::Early => write!(f, "early"),
            Timing::OnTime => write!(f, "on time"),
            Timing::Late => write!(f, "late"),
        }
    }
}

impl DoseEvent {
    pub fn medication_id(&self) -> &str { &self.medication_id }
    pub fn scheduled(&self) -> NaiveDateTime { self.scheduled }
    pub fn confirmed_at(&self) -> NaiveDateTime { self.confirmed_at }
    pub fn timing(&self) -> Timing { self.timing }

    pub fn occurrence(&self) -> Occurrence {
        Occurrence::new(self.medication_id.clone(), self.scheduled)
    }
}

struct TimeOfDayVisitor;
impl<'de> Visitor<'de> for TimeOfDayVisitor {
    type Value = TimeOfDay;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a time of day as hours and minutes separated with a colon")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.trim().parse()
            .map_err(|e| E::custom(format!("invalid time of day {:?}: {}", v, e)))
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<TimeOfDay, D::Error>
    {
        deserializer.deserialize_str(TimeOfDayVisitor)
    }
}
impl Serialize for TimeOfDay {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error>
    {
        serializer.serialize_str(&self.to_string())
    }
}
