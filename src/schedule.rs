//! Expansion of a medication's times of day over its course into dose occurrences.

use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};
use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;
use crate::model::{CourseLength, Medication, Occurrence};


/// Calendar days `[from, to)`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, new, PartialEq, Serialize)]
pub struct DateRange {
    from: NaiveDate,
    to: NaiveDate,
}

/// Lazy sequence of occurrences, day by day and in time-of-day order.
///
/// Cloning a fresh sequence (or calling [`Occurrences::restart`]) yields the
/// same occurrences again.
#[derive(Clone, Debug)]
pub struct Occurrences {
    medication_id: String,
    times: Vec<NaiveTime>,
    first_day: NaiveDate,
    day: NaiveDate,
    end: NaiveDate,
    time_index: usize,
}


impl DateRange {
    pub fn start(&self) -> NaiveDate { self.from }
    pub fn end(&self) -> NaiveDate { self.to }

    pub fn single_day(day: NaiveDate) -> DateRange {
        DateRange::new(day, day.succ_opt().unwrap_or(day))
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.from <= day && day < self.to
    }
}

impl Occurrences {
    pub fn restart(&self) -> Occurrences {
        Occurrences {
            medication_id: self.medication_id.clone(),
            times: self.times.clone(),
            first_day: self.first_day,
            day: self.first_day,
            end: self.end,
            time_index: 0,
        }
    }
}

impl Iterator for Occurrences {
    type Item = Occurrence;

    fn next(&mut self) -> Option<Occurrence> {
        if self.times.is_empty() {
            return None;
        }
        while self.day < self.end {
            if let Some(time) = self.times.get(self.time_index) {
                self.time_index += 1;
                return Some(Occurrence::new(self.medication_id.clone(), self.day.and_time(*time)));
            }
            self.time_index = 0;
            self.day = self.day.succ_opt()?;
        }
        None
    }
}


/// Occurrences of `medication` on the days of `range` that also lie within its course.
pub fn occurrences(medication: &Medication, range: DateRange) -> Result<Occurrences, ScheduleError> {
    medication.validate()?;

    let start = medication.start_date().max(range.start());
    let course_end = match medication.course_length()? {
        CourseLength::Days(days) => medication.start_date()
            .checked_add_days(Days::new(u64::from(days)))
            .ok_or_else(|| ScheduleError::InvalidSchedule {
                medication_id: medication.id().to_owned(),
                reason: format!("course of {} days overflows the calendar", days),
            })?,
        // never materialize past the requested horizon
        CourseLength::Indefinite => range.end(),
    };
    let end = course_end.min(range.end()).max(start);

    Ok(Occurrences {
        medication_id: medication.id().to_owned(),
        times: medication.schedule_times(),
        first_day: start,
        day: start,
        end,
        time_index: 0,
    })
}

/// Occurrences scheduled in the half-open instant window `[from, to)`.
pub fn occurrences_between(
    medication: &Medication,
    from: NaiveDateTime,
    to: NaiveDateTime,
) -> Result<impl Iterator<Item = Occurrence>, ScheduleError> {
    let last_day = to.date().succ_opt().unwrap_or(to.date());
    let days = DateRange::new(from.date(), last_day);
    Ok(occurrences(medication, days)?
        .filter(move |o| from <= o.scheduled() && o.scheduled() < to))
}

/// Whether `scheduled` is one of the medication's generated occurrences.
pub fn is_scheduled(medication: &Medication, scheduled: NaiveDateTime) -> Result<bool, ScheduleError> {
    let found = occurrences(medication, DateRange::single_day(scheduled.date()))?
        .any(|o| o.scheduled() == scheduled);
    Ok(found)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{INDEFINITE_DURATION, TimeOfDay};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn med(times: &[&str], duration_days: i64) -> Medication {
        Medication::new(
            "m1".to_owned(), "u1".to_owned(), "Metformin".to_owned(), "500 mg".to_owned(),
            times.iter().map(|t| t.parse::<TimeOfDay>().unwrap()).collect(),
            day(2024, 1, 1), duration_days, true, true, "blue".to_owned(), 30, 60, 25, None,
        )
    }

    #[test]
    fn two_daily_times_for_a_week() {
        let m = med(&["09:00", "21:00"], 7);
        let occs: Vec<Occurrence> = occurrences(&m, DateRange::new(day(2024, 1, 1), day(2024, 1, 8)))
            .unwrap()
            .collect();
        assert_eq!(occs.len(), 14);
        assert!(occs.iter().all(|o| o.scheduled() >= day(2024, 1, 1).and_hms_opt(0, 0, 0).unwrap()));
        assert!(occs.iter().all(|o| o.scheduled() < day(2024, 1, 8).and_hms_opt(0, 0, 0).unwrap()));
        assert_eq!(occs[0].scheduled(), day(2024, 1, 1).and_hms_opt(9, 0, 0).unwrap());
        assert_eq!(occs[1].scheduled(), day(2024, 1, 1).and_hms_opt(21, 0, 0).unwrap());
    }

    #[test]
    fn range_wider_than_course_is_clipped() {
        let m = med(&["09:00", "21:00"], 7);
        let count = occurrences(&m, DateRange::new(day(2023, 12, 1), day(2024, 2, 1)))
            .unwrap()
            .count();
        assert_eq!(count, 14);
    }

    #[test]
    fn range_before_start_is_empty() {
        let m = med(&["09:00"], 7);
        let count = occurrences(&m, DateRange::new(day(2023, 12, 1), day(2023, 12, 31)))
            .unwrap()
            .count();
        assert_eq!(count, 0);
    }

    #[test]
    fn indefinite_course_stops_at_horizon() {
        let m = med(&["08:00"], INDEFINITE_DURATION);
        let count = occurrences(&m, DateRange::new(day(2024, 3, 1), day(2024, 3, 11)))
            .unwrap()
            .count();
        assert_eq!(count, 10);
    }

    #[test]
    fn restart_replays_sequence() {
        let m = med(&["09:00", "21:00"], 2);
        let mut occs = occurrences(&m, DateRange::new(day(2024, 1, 1), day(2024, 1, 3))).unwrap();
        let first: Vec<Occurrence> = occs.by_ref().collect();
        let again: Vec<Occurrence> = occs.restart().collect();
        assert_eq!(first, again);
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn malformed_duration_is_rejected() {
        let m = med(&["09:00"], -3);
        let res = occurrences(&m, DateRange::new(day(2024, 1, 1), day(2024, 1, 8)));
        assert!(matches!(res, Err(ScheduleError::InvalidSchedule { .. })));
    }

    #[test]
    fn instant_window_filters_by_time() {
        let m = med(&["09:00", "21:00"], 7);
        let from = day(2024, 1, 2).and_hms_opt(10, 0, 0).unwrap();
        let to = day(2024, 1, 3).and_hms_opt(10, 0, 0).unwrap();
        let occs: Vec<Occurrence> = occurrences_between(&m, from, to).unwrap().collect();
        assert_eq!(occs.len(), 2);
        assert_eq!(occs[0].scheduled(), day(2024, 1, 2).and_hms_opt(21, 0, 0).unwrap());
        assert_eq!(occs[1].scheduled(), day(2024, 1, 3).and_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn scheduled_lookup() {
        let m = med(&["09:00"], 7);
        assert!(is_scheduled(&m, day(2024, 1, 3).and_hms_opt(9, 0, 0).unwrap()).unwrap());
        assert!(!is_scheduled(&m, day(2024, 1, 3).and_hms_opt(9, 5, 0).unwrap()).unwrap());
        assert!(!is_scheduled(&m, day(2024, 1, 9).and_hms_opt(9, 0, 0).unwrap()).unwrap());
    }
}
