//! Read-time classification of occurrences into lifecycle states.
//!
//! Nothing here is stored; calling [`classify`] again with the same inputs
//! always gives the same answer, and "missed" exists only as its result.

use std::fmt;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::model::{DoseEvent, Timing};


/// Offset from the scheduled time at which an occurrence becomes active.
pub const PRE_WINDOW_MINUTES: i64 = -30;

/// Half-width of the on-time band around the scheduled time.
pub const ON_TIME_WINDOW_MINUTES: i64 = 30;

/// Offset after which an unconfirmed occurrence is missed.
pub const LATE_END_MINUTES: i64 = 120;


#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "timing")]
pub enum DoseState {
    Upcoming,
    /// Inside the window and not yet taken; the dose is due.
    Active,
    Taken(Timing),
    Missed,
}


impl DoseState {
    pub fn is_due(&self) -> bool {
        matches!(self, DoseState::Active)
    }
}

impl fmt::Display for DoseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoseState::Upcoming => write!(f, "upcoming"),
            DoseState::Active => write!(f, "due"),
            DoseState::Taken(timing) => write!(f, "taken ({})", timing),
            DoseState::Missed => write!(f, "missed"),
        }
    }
}


pub fn pre_window() -> Duration { Duration::minutes(PRE_WINDOW_MINUTES) }
pub fn on_time_window() -> Duration { Duration::minutes(ON_TIME_WINDOW_MINUTES) }
pub fn late_end() -> Duration { Duration::minutes(LATE_END_MINUTES) }

/// Timing of a confirmation relative to its scheduled time.
///
/// Confirmations past the late end still count as late; whether they are
/// accepted at all is decided by the confirmation handler.
pub fn timing_of(scheduled: NaiveDateTime, confirmed_at: NaiveDateTime) -> Timing {
    let offset = confirmed_at - scheduled;
    if offset <= -on_time_window() {
        Timing::Early
    } else if offset <= on_time_window() {
        Timing::OnTime
    } else {
        Timing::Late
    }
}

pub fn classify(scheduled: NaiveDateTime, now: NaiveDateTime, event: Option<&DoseEvent>) -> DoseState {
    if let Some(ev) = event {
        return DoseState::Taken(timing_of(scheduled, ev.confirmed_at()));
    }

    if now < scheduled + pre_window() {
        DoseState::Upcoming
    } else if now <= scheduled + late_end() {
        DoseState::Active
    } else {
        DoseState::Missed
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn nine() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(9, 0, 0).unwrap()
    }

    fn taken_at(offset_minutes: i64) -> DoseEvent {
        let confirmed = nine() + Duration::minutes(offset_minutes);
        DoseEvent::new("m1".to_owned(), nine(), confirmed, timing_of(nine(), confirmed))
    }

    #[test]
    fn timing_bands() {
        assert_eq!(timing_of(nine(), nine() + Duration::minutes(10)), Timing::OnTime);
        assert_eq!(timing_of(nine(), nine() + Duration::minutes(45)), Timing::Late);
        assert_eq!(timing_of(nine(), nine() - Duration::minutes(40)), Timing::Early);
        assert_eq!(timing_of(nine(), nine() - Duration::minutes(30)), Timing::Early);
        assert_eq!(timing_of(nine(), nine() + Duration::minutes(30)), Timing::OnTime);
        assert_eq!(timing_of(nine(), nine() + Duration::minutes(200)), Timing::Late);
    }

    #[test]
    fn unconfirmed_lifecycle() {
        let at = |m: i64| classify(nine(), nine() + Duration::minutes(m), None);
        assert_eq!(at(-31), DoseState::Upcoming);
        assert_eq!(at(-30), DoseState::Active);
        assert_eq!(at(100), DoseState::Active);
        assert!(at(100).is_due());
        assert_eq!(at(120), DoseState::Active);
        assert_eq!(at(121), DoseState::Missed);
    }

    #[test]
    fn event_wins_over_clock() {
        let ev = taken_at(10);
        let later = nine() + Duration::hours(5);
        assert_eq!(classify(nine(), later, Some(&ev)), DoseState::Taken(Timing::OnTime));
        // same inputs, same answer
        assert_eq!(classify(nine(), later, Some(&ev)), classify(nine(), later, Some(&ev)));
    }
}
