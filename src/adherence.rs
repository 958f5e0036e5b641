//! Adherence statistics over due occurrences.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;
use num_rational::Rational64;
use serde::Serialize;

use crate::error::ScheduleError;
use crate::model::{DoseEvent, Medication, Occurrence, Timing};
use crate::schedule::{occurrences, DateRange};
use crate::util::{frac2percent, ratio};
use crate::window::{classify, DoseState};


#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct AdherenceStats {
    pub due: u64,
    pub taken: u64,
    pub early: u64,
    pub on_time: u64,
    pub late: u64,
    pub missed: u64,
    /// Due and untaken, but still inside the late window.
    pub pending: u64,
    pub rate: Rational64,
}


impl AdherenceStats {
    /// `taken / due * 100`, zero when nothing was due.
    pub fn percent(&self) -> f64 {
        frac2percent(self.rate)
    }

    fn count(&mut self, state: DoseState) {
        self.due += 1;
        match state {
            DoseState::Taken(timing) => {
                self.taken += 1;
                match timing {
                    Timing::Early => self.early += 1,
                    Timing::OnTime => self.on_time += 1,
                    Timing::Late => self.late += 1,
                }
            },
            DoseState::Missed => self.missed += 1,
            DoseState::Active | DoseState::Upcoming => self.pending += 1,
        }
    }

    fn finish(mut self) -> AdherenceStats {
        self.rate = ratio(self.taken, self.due);
        self
    }
}


/// Statistics per medication over `range`, counting only occurrences
/// scheduled at or before `now`.
pub fn adherence_by_medication(
    medications: &[Medication],
    events: &[DoseEvent],
    range: DateRange,
    now: NaiveDateTime,
) -> Result<BTreeMap<String, AdherenceStats>, ScheduleError> {
    let by_occurrence: HashMap<Occurrence, &DoseEvent> = events.iter()
        .map(|e| (e.occurrence(), e))
        .collect();

    let mut per_med = BTreeMap::new();
    for med in medications.iter().filter(|m| m.active()) {
        let mut stats = AdherenceStats::default();
        for occ in occurrences(med, range)?.take_while(|o| o.scheduled() <= now) {
            let event = by_occurrence.get(&occ).copied();
            stats.count(classify(occ.scheduled(), now, event));
        }
        per_med.insert(med.id().to_owned(), stats.finish());
    }
    Ok(per_med)
}

pub fn adherence(
    medications: &[Medication],
    events: &[DoseEvent],
    range: DateRange,
    now: NaiveDateTime,
) -> Result<AdherenceStats, ScheduleError> {
    let per_med = adherence_by_medication(medications, events, range, now)?;
    let mut total = AdherenceStats::default();
    for s in per_med.values() {
        total.due += s.due;
        total.taken += s.taken;
        total.early += s.early;
        total.on_time += s.on_time;
        total.late += s.late;
        total.missed += s.missed;
        total.pending += s.pending;
    }
    Ok(total.finish())
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn med(id: &str, times: &[&str]) -> Medication {
        Medication::new(
            id.to_owned(), "u1".to_owned(), "Amlodipine".to_owned(), "5 mg".to_owned(),
            times.iter().map(|t| t.parse().unwrap()).collect(),
            day(1), 30, true, true, "pink".to_owned(), 60, 60, 20, None,
        )
    }

    fn taken(id: &str, scheduled: NaiveDateTime, offset_minutes: i64, timing: Timing) -> DoseEvent {
        DoseEvent::new(id.to_owned(), scheduled, scheduled + Duration::minutes(offset_minutes), timing)
    }

    #[test]
    fn ten_due_eight_taken() {
        let m = med("m1", &["09:00", "21:00"]);
        // days 1..=5 fully elapsed: 10 due
        let now = day(6).and_hms_opt(8, 0, 0).unwrap();
        let mut events = Vec::new();
        for d in 1..=4 {
            events.push(taken("m1", day(d).and_hms_opt(9, 0, 0).unwrap(), 5, Timing::OnTime));
            events.push(taken("m1", day(d).and_hms_opt(21, 0, 0).unwrap(), 45, Timing::Late));
        }
        let range = DateRange::new(day(1), day(10));
        let stats = adherence(&[m], &events, range, now).unwrap();
        assert_eq!(stats.due, 10);
        assert_eq!(stats.taken, 8);
        assert_eq!(stats.on_time, 4);
        assert_eq!(stats.late, 4);
        assert_eq!(stats.missed, 2);
        assert_eq!(stats.rate, Rational64::new(4, 5));
        assert!((stats.percent() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn nothing_due_is_zero_percent() {
        let m = med("m1", &["09:00"]);
        let now = day(1).and_hms_opt(6, 0, 0).unwrap();
        let stats = adherence(&[m], &[], DateRange::new(day(1), day(8)), now).unwrap();
        assert_eq!(stats.due, 0);
        assert_eq!(stats.percent(), 0.0);
    }

    #[test]
    fn active_dose_is_pending_not_missed() {
        let m = med("m1", &["09:00"]);
        let now = day(1).and_hms_opt(10, 0, 0).unwrap();
        let stats = adherence(&[m], &[], DateRange::new(day(1), day(2)), now).unwrap();
        assert_eq!(stats.due, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.missed, 0);
    }

    #[test]
    fn per_medication_breakdown_and_inactive_skipped() {
        let a = med("a", &["09:00"]);
        let b = med("b", &["09:00"]);
        let stopped = Medication::new(
            "c".to_owned(), "u1".to_owned(), "Warfarin".to_owned(), "2 mg".to_owned(),
            vec!["09:00".parse().unwrap()], day(1), 30, false, true, "grey".to_owned(), 1, 1, 0, None,
        );
        let now = day(3).and_hms_opt(0, 0, 0).unwrap();
        let events = vec![taken("a", day(1).and_hms_opt(9, 0, 0).unwrap(), -40, Timing::Early)];
        let per = adherence_by_medication(&[a, b, stopped], &events, DateRange::new(day(1), day(3)), now).unwrap();
        assert_eq!(per.len(), 2);
        assert_eq!(per["a"].early, 1);
        assert_eq!(per["a"].due, 2);
        assert_eq!(per["b"].taken, 0);
        assert_eq!(per["b"].missed, 2);
    }
}
