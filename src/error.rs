use chrono::NaiveDateTime;
use thiserror::Error;


#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ScheduleError {
    #[error("invalid schedule for medication {medication_id}: {reason}")]
    InvalidSchedule { medication_id: String, reason: String },
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum StoreError {
    #[error("medication {0} not found")]
    NotFound(String),

    #[error("medication store I/O failed: {0}")]
    Io(String),

    #[error("medication store data is malformed: {0}")]
    Format(String),

    #[error("medication store did not answer within {0} ms")]
    Timeout(u128),
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum NotifyError {
    #[error("failed to schedule notification: {0}")]
    NotificationSchedulingFailed(String),

    #[error("failed to cancel trigger {trigger_id}: {reason}")]
    CancelFailed { trigger_id: String, reason: String },

    #[error("notification backend did not answer within {0} ms")]
    Timeout(u128),
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum LogError {
    #[error("a dose event for {0} is already recorded")]
    AlreadyRecorded(String),

    #[error("dose log I/O failed: {0}")]
    Io(String),

    #[error("dose log data is malformed: {0}")]
    Format(String),
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ConfirmError {
    #[error("confirmation at {confirmed_at} is outside the window {opens}..={closes}")]
    OutOfWindow {
        confirmed_at: NaiveDateTime,
        opens: NaiveDateTime,
        closes: NaiveDateTime,
    },

    #[error("a dose event for {0} is already recorded")]
    AlreadyRecorded(String),

    #[error("medication {0} is unknown or inactive")]
    UnknownMedication(String),

    #[error("{0} is not a scheduled occurrence")]
    UnknownOccurrence(String),

    #[error(transparent)]
    InvalidSchedule(#[from] ScheduleError),

    #[error("dose log failure: {0}")]
    Log(String),

    #[error(transparent)]
    Store(StoreError),
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum SupplyError {
    #[error("cannot refill medication {0}: total supply is not positive")]
    InvalidRefill(String),

    #[error("medication {0} is unknown")]
    UnknownMedication(String),

    #[error(transparent)]
    Store(StoreError),
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ParseOccurrenceError {
    #[error("occurrence id must look like <medication-id>@<YYYY-MM-DDTHH:MM>")]
    MissingSeparator,

    #[error("invalid scheduled time in occurrence id: {0}")]
    BadTime(String),
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum QueryError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}


impl From<StoreError> for ConfirmError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ConfirmError::UnknownMedication(id),
            other => ConfirmError::Store(other),
        }
    }
}

impl From<LogError> for ConfirmError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::AlreadyRecorded(occ) => ConfirmError::AlreadyRecorded(occ),
            other => ConfirmError::Log(other.to_string()),
        }
    }
}

impl From<StoreError> for SupplyError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SupplyError::UnknownMedication(id),
            other => SupplyError::Store(other),
        }
    }
}
