//! Keeps the notification backend's triggers in step with the dose schedule.
//!
//! Each occurrence inside the reminder horizon gets a trigger at its scheduled
//! time, one every 15 minutes through the first hour, and a last one at +90
//! minutes. Nothing is scheduled past the late window.
//!
//! The trigger bookkeeping lock is only held to read or change the map, never
//! across a backend call. An occurrence's entry is removed before its triggers
//! are canceled at the backend, so [`ReminderScheduler::is_live`] stops
//! vouching for a trigger the moment cancellation starts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dose_log::DoseLog;
use crate::error::NotifyError;
use crate::model::{EngineSettings, Medication, Occurrence};
use crate::notify::{Notifier, ReminderPayload, TriggerId};
use crate::schedule::occurrences_between;
use crate::util::bounded;
use crate::window::late_end;


/// Trigger offsets in minutes after the scheduled time.
pub const TRIGGER_OFFSETS_MINUTES: [i64; 6] = [0, 15, 30, 45, 60, 90];


#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SyncReport {
    pub scheduled: usize,
    /// Triggers given up on after the retry.
    pub omitted: usize,
    pub canceled: usize,
    pub cancel_failures: usize,
}

pub struct ReminderScheduler {
    notifier: Arc<dyn Notifier>,
    settings: EngineSettings,
    triggers: Mutex<BTreeMap<Occurrence, Vec<TriggerId>>>,
    /// Held for a whole sync or bulk cancel; confirmation and delivery never take it.
    syncing: Mutex<()>,
}


impl SyncReport {
    pub(crate) fn absorb(&mut self, other: SyncReport) {
        self.scheduled += other.scheduled;
        self.omitted += other.omitted;
        self.canceled += other.canceled;
        self.cancel_failures += other.cancel_failures;
    }
}

impl ReminderScheduler {
    pub fn new(notifier: Arc<dyn Notifier>, settings: EngineSettings) -> ReminderScheduler {
        ReminderScheduler {
            notifier,
            settings,
            triggers: Mutex::new(BTreeMap::new()),
            syncing: Mutex::new(()),
        }
    }

    pub fn trigger_times(scheduled: NaiveDateTime) -> Vec<(i64, NaiveDateTime)> {
        TRIGGER_OFFSETS_MINUTES.iter()
            .map(|m| (*m, scheduled + Duration::minutes(*m)))
            .collect()
    }

    /// Replaces every trigger of `medication` with a fresh set for the horizon.
    ///
    /// Old triggers are canceled before any new one is scheduled. Occurrences
    /// already in `log` get no triggers, including ones confirmed while their
    /// triggers were being scheduled.
    pub async fn sync_medication(&self, medication: &Medication, log: &DoseLog, now: NaiveDateTime) -> SyncReport {
        let _sync = self.syncing.lock().await;

        let stale = self.take_medication(medication.id()).await;
        let mut report = self.cancel_each(stale).await;

        if !medication.active() || !medication.reminders_enabled() {
            debug!("reminders off for medication {}", medication.id());
            return report;
        }

        // the last trigger of anything scheduled before this has already fired
        let last_offset = Duration::minutes(TRIGGER_OFFSETS_MINUTES[TRIGGER_OFFSETS_MINUTES.len() - 1]);
        let window = occurrences_between(medication, now - last_offset, now + self.settings.reminder_horizon);
        let upcoming: Vec<Occurrence> = match window {
            Ok(occs) => occs.collect(),
            Err(e) => {
                warn!("not scheduling reminders: {}", e);
                return report;
            },
        };

        for occ in upcoming {
            if log.get(&occ).await.is_some() {
                continue;
            }
            let mut ids = Vec::new();
            for (offset, at) in Self::trigger_times(occ.scheduled()) {
                if at <= now {
                    continue;
                }
                let payload = ReminderPayload::new(
                    occ.clone(),
                    medication.name().to_owned(),
                    medication.dosage().to_owned(),
                    offset,
                );
                match self.schedule_with_retry(at, payload).await {
                    Ok(id) => {
                        ids.push(id);
                        report.scheduled += 1;
                    },
                    Err(e) => {
                        warn!("reminder for {} at {} omitted: {}", occ, at, e);
                        report.omitted += 1;
                    },
                }
            }
            if ids.is_empty() {
                continue;
            }

            // a confirmation lands in the log before it clears the bookkeeping,
            // so checking again under the lock cannot miss one
            let raced = {
                let mut triggers = self.triggers.lock().await;
                if log.get(&occ).await.is_some() {
                    Some(ids)
                } else {
                    triggers.entry(occ.clone()).or_default().extend(ids);
                    None
                }
            };
            if let Some(ids) = raced {
                debug!("{} was confirmed while its reminders were being scheduled", occ);
                report.absorb(cancel_triggers(self.notifier.as_ref(), self.settings.collaborator_timeout, &occ, ids).await);
            }
        }

        info!(
            "medication {}: {} triggers scheduled, {} omitted, {} canceled",
            medication.id(), report.scheduled, report.omitted, report.canceled,
        );
        report
    }

    /// Cancels whatever is left for one occurrence, typically after it was taken.
    pub async fn cancel_occurrence(&self, occurrence: &Occurrence) -> SyncReport {
        let ids = self.triggers.lock().await.remove(occurrence);
        match ids {
            Some(ids) => cancel_triggers(self.notifier.as_ref(), self.settings.collaborator_timeout, occurrence, ids).await,
            None => SyncReport::default(),
        }
    }

    /// Drops an occurrence's bookkeeping right away and cancels its triggers
    /// at the backend in a background task.
    pub async fn release_occurrence(&self, occurrence: &Occurrence) -> JoinHandle<SyncReport> {
        let ids = self.triggers.lock().await
            .remove(occurrence)
            .unwrap_or_default();
        let notifier = self.notifier.clone();
        let limit = self.settings.collaborator_timeout;
        let occurrence = occurrence.clone();
        tokio::spawn(async move {
            cancel_triggers(notifier.as_ref(), limit, &occurrence, ids).await
        })
    }

    /// Cancels all triggers of a medication. Individual failures are logged
    /// and counted; the rest still get canceled.
    pub async fn cancel_medication(&self, medication_id: &str) -> SyncReport {
        let _sync = self.syncing.lock().await;
        let taken = self.take_medication(medication_id).await;
        self.cancel_each(taken).await
    }

    /// Forgets occurrences whose late window has closed; their triggers
    /// have all fired by then.
    pub async fn prune_expired(&self, now: NaiveDateTime) -> usize {
        let mut triggers = self.triggers.lock().await;
        let before = triggers.len();
        triggers.retain(|occ, _| occ.scheduled() + late_end() >= now);
        before - triggers.len()
    }

    /// Whether a trigger still belongs to a pending reminder. Backends ask
    /// this right before delivering.
    pub async fn is_live(&self, trigger_id: &TriggerId) -> bool {
        self.triggers.lock().await
            .values()
            .any(|ids| ids.contains(trigger_id))
    }

    pub async fn triggers_for(&self, occurrence: &Occurrence) -> Vec<TriggerId> {
        self.triggers.lock().await
            .get(occurrence)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn pending_occurrences(&self) -> Vec<Occurrence> {
        self.triggers.lock().await
            .keys()
            .cloned()
            .collect()
    }

    /// Medications that currently have reminders on the books.
    pub async fn tracked_medications(&self) -> BTreeSet<String> {
        self.triggers.lock().await
            .keys()
            .map(|o| o.medication_id().to_owned())
            .collect()
    }

    async fn take_medication(&self, medication_id: &str) -> Vec<(Occurrence, Vec<TriggerId>)> {
        let mut triggers = self.triggers.lock().await;
        let occs: Vec<Occurrence> = triggers.keys()
            .filter(|o| o.medication_id() == medication_id)
            .cloned()
            .collect();
        occs.into_iter()
            .filter_map(|occ| triggers.remove(&occ).map(|ids| (occ, ids)))
            .collect()
    }

    async fn cancel_each(&self, taken: Vec<(Occurrence, Vec<TriggerId>)>) -> SyncReport {
        let mut report = SyncReport::default();
        for (occ, ids) in taken {
            report.absorb(cancel_triggers(self.notifier.as_ref(), self.settings.collaborator_timeout, &occ, ids).await);
        }
        report
    }

    async fn schedule_with_retry(&self, at: NaiveDateTime, payload: ReminderPayload) -> Result<TriggerId, NotifyError> {
        let first = bounded(
            self.settings.collaborator_timeout,
            self.notifier.schedule(at, payload.clone()),
            NotifyError::Timeout,
        ).await;
        match first {
            Ok(id) => return Ok(id),
            Err(e) => debug!("scheduling trigger at {} failed, retrying: {}", at, e),
        }

        tokio::time::sleep(self.settings.retry_backoff).await;
        bounded(
            self.settings.collaborator_timeout,
            self.notifier.schedule(at, payload),
            NotifyError::Timeout,
        ).await
            .map_err(|e| NotifyError::NotificationSchedulingFailed(e.to_string()))
    }
}


async fn cancel_triggers(notifier: &dyn Notifier, limit: StdDuration, occurrence: &Occurrence, ids: Vec<TriggerId>) -> SyncReport {
    let mut report = SyncReport::default();
    for id in ids {
        match bounded(limit, notifier.cancel(&id), NotifyError::Timeout).await {
            Ok(()) => report.canceled += 1,
            Err(e) => {
                warn!("failed to cancel trigger {} of {}: {}", id, occurrence, e);
                report.cancel_failures += 1;
            },
        }
    }
    report
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use crate::model::{DoseEvent, Timing};
    use crate::notify::TracingNotifier;

    fn settings() -> EngineSettings {
        EngineSettings::new(
            Duration::hours(24),
            Duration::minutes(60),
            StdDuration::from_millis(100),
            StdDuration::from_millis(1),
        )
    }

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn med(reminders: bool) -> Medication {
        Medication::new(
            "m1".to_owned(), "u1".to_owned(), "Levothyroxine".to_owned(), "50 mcg".to_owned(),
            vec!["09:00".parse().unwrap(), "21:00".parse().unwrap()],
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            30, true, reminders, "green".to_owned(), 50, 60, 20, None,
        )
    }

    /// Fails the first `failures` schedule calls and every cancel.
    #[derive(Default)]
    struct FlakyNotifier {
        failures: usize,
        schedule_calls: AtomicUsize,
        inner: TracingNotifier,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn schedule(&self, trigger_time: NaiveDateTime, payload: ReminderPayload) -> Result<TriggerId, NotifyError> {
            let n = self.schedule_calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(NotifyError::NotificationSchedulingFailed("backend busy".to_owned()));
            }
            self.inner.schedule(trigger_time, payload).await
        }

        async fn cancel(&self, trigger_id: &TriggerId) -> Result<(), NotifyError> {
            Err(NotifyError::CancelFailed { trigger_id: trigger_id.to_string(), reason: "gone".to_owned() })
        }
    }

    /// Confirms `target` from inside the backend the first time one of its
    /// triggers is scheduled.
    struct ConfirmingNotifier {
        log: Arc<DoseLog>,
        target: Occurrence,
        inner: TracingNotifier,
    }

    #[async_trait]
    impl Notifier for ConfirmingNotifier {
        async fn schedule(&self, trigger_time: NaiveDateTime, payload: ReminderPayload) -> Result<TriggerId, NotifyError> {
            if payload.occurrence() == &self.target {
                let ev = DoseEvent::new(
                    self.target.medication_id().to_owned(),
                    self.target.scheduled(),
                    self.target.scheduled(),
                    Timing::OnTime,
                );
                let _ = self.log.append(ev).await;
            }
            self.inner.schedule(trigger_time, payload).await
        }

        async fn cancel(&self, trigger_id: &TriggerId) -> Result<(), NotifyError> {
            self.inner.cancel(trigger_id).await
        }
    }

    /// Never answers.
    struct HangingNotifier;

    #[async_trait]
    impl Notifier for HangingNotifier {
        async fn schedule(&self, _trigger_time: NaiveDateTime, _payload: ReminderPayload) -> Result<TriggerId, NotifyError> {
            std::future::pending().await
        }

        async fn cancel(&self, _trigger_id: &TriggerId) -> Result<(), NotifyError> {
            std::future::pending().await
        }
    }

    #[test]
    fn trigger_offsets_stop_before_late_end() {
        let times = ReminderScheduler::trigger_times(at(1, 9, 0));
        assert_eq!(times.first().unwrap().1, at(1, 9, 0));
        assert_eq!(times.last().unwrap().1, at(1, 10, 30));
        assert!(times.iter().all(|(_, t)| *t <= at(1, 9, 0) + late_end()));
    }

    #[tokio::test]
    async fn schedules_horizon_and_skips_past_triggers() {
        let notifier = Arc::new(TracingNotifier::default());
        let sched = ReminderScheduler::new(notifier.clone(), settings());
        let log = DoseLog::in_memory();

        // 09:20: the 09:00 dose still has 09:30, 09:45, 10:00, 10:30 ahead
        let report = sched.sync_medication(&med(true), &log, at(2, 9, 20)).await;
        let morning = Occurrence::new("m1".to_owned(), at(2, 9, 0));
        assert_eq!(sched.triggers_for(&morning).await.len(), 4);
        // 21:00 today and 09:00 tomorrow get all six
        assert_eq!(report.scheduled, 4 + 6 + 6);
        assert_eq!(notifier.pending_count().await, 16);
    }

    #[tokio::test]
    async fn resync_cancels_before_rescheduling() {
        let notifier = Arc::new(TracingNotifier::default());
        let sched = ReminderScheduler::new(notifier.clone(), settings());
        let log = DoseLog::in_memory();

        sched.sync_medication(&med(true), &log, at(2, 8, 0)).await;
        let report = sched.sync_medication(&med(true), &log, at(2, 8, 0)).await;
        assert_eq!(report.canceled, report.scheduled);
        assert_eq!(notifier.pending_count().await, report.scheduled);

        let off = sched.sync_medication(&med(false), &log, at(2, 8, 0)).await;
        assert_eq!(off.scheduled, 0);
        assert_eq!(notifier.pending_count().await, 0);
        assert!(sched.pending_occurrences().await.is_empty());
    }

    #[tokio::test]
    async fn taken_occurrences_get_no_triggers() {
        let notifier = Arc::new(TracingNotifier::default());
        let sched = ReminderScheduler::new(notifier, settings());
        let log = DoseLog::in_memory();
        log.append(DoseEvent::new("m1".to_owned(), at(2, 9, 0), at(2, 8, 50), Timing::OnTime)).await.unwrap();

        sched.sync_medication(&med(true), &log, at(2, 8, 0)).await;
        assert!(sched.triggers_for(&Occurrence::new("m1".to_owned(), at(2, 9, 0))).await.is_empty());
    }

    #[tokio::test]
    async fn cancel_occurrence_kills_liveness() {
        let notifier = Arc::new(TracingNotifier::default());
        let sched = ReminderScheduler::new(notifier.clone(), settings());
        let log = DoseLog::in_memory();
        sched.sync_medication(&med(true), &log, at(2, 8, 0)).await;

        let occ = Occurrence::new("m1".to_owned(), at(2, 9, 0));
        let ids = sched.triggers_for(&occ).await;
        assert!(sched.is_live(&ids[0]).await);

        let report = sched.cancel_occurrence(&occ).await;
        assert_eq!(report.canceled, 6);
        assert!(!sched.is_live(&ids[0]).await);
    }

    #[tokio::test]
    async fn one_failure_is_retried() {
        let notifier = Arc::new(FlakyNotifier { failures: 1, ..Default::default() });
        let sched = ReminderScheduler::new(notifier.clone(), settings());
        let report = sched.sync_medication(&med(true), &DoseLog::in_memory(), at(2, 20, 0)).await;
        assert_eq!(report.omitted, 0);
        assert_eq!(report.scheduled, 12);
    }

    #[tokio::test]
    async fn persistent_failure_omits_and_cancel_failures_do_not_abort() {
        let notifier = Arc::new(FlakyNotifier { failures: 2, ..Default::default() });
        let sched = ReminderScheduler::new(notifier.clone(), settings());
        let report = sched.sync_medication(&med(true), &DoseLog::in_memory(), at(2, 20, 0)).await;
        assert_eq!(report.omitted, 1);
        assert_eq!(report.scheduled, 11);

        let cancel = sched.cancel_medication("m1").await;
        assert_eq!(cancel.cancel_failures, 11);
        assert!(sched.pending_occurrences().await.is_empty());
    }

    #[tokio::test]
    async fn prune_drops_closed_windows() {
        let sched = ReminderScheduler::new(Arc::new(TracingNotifier::default()), settings());
        sched.sync_medication(&med(true), &DoseLog::in_memory(), at(2, 8, 0)).await;
        let pruned = sched.prune_expired(at(2, 11, 1)).await;
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn confirmation_during_sync_wins() {
        let log = Arc::new(DoseLog::in_memory());
        let target = Occurrence::new("m1".to_owned(), at(2, 9, 0));
        let notifier = Arc::new(ConfirmingNotifier {
            log: log.clone(),
            target: target.clone(),
            inner: TracingNotifier::default(),
        });
        let sched = ReminderScheduler::new(notifier.clone(), settings());

        let report = sched.sync_medication(&med(true), &log, at(2, 8, 0)).await;
        assert_eq!(report.scheduled, 12);
        assert_eq!(report.canceled, 6);
        assert!(sched.triggers_for(&target).await.is_empty());
        // only the 21:00 dose keeps its triggers
        assert_eq!(notifier.inner.pending_count().await, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hung_backend_does_not_hold_the_bookkeeping() {
        let sched = Arc::new(ReminderScheduler::new(Arc::new(HangingNotifier), settings()));
        let syncing = {
            let sched = sched.clone();
            tokio::spawn(async move {
                sched.sync_medication(&med(true), &DoseLog::in_memory(), at(2, 8, 0)).await
            })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let occ = Occurrence::new("m1".to_owned(), at(2, 9, 0));
        let released = sched.release_occurrence(&occ).await.await.unwrap();
        assert_eq!(released, SyncReport::default());
        assert!(!sched.is_live(&TriggerId("t0".to_owned())).await);
        assert!(started.elapsed() < StdDuration::from_millis(100));

        let report = syncing.await.unwrap();
        assert_eq!(report.scheduled, 0);
        assert_eq!(report.omitted, 12);
    }

    #[tokio::test]
    async fn released_occurrence_is_canceled_in_background() {
        let notifier = Arc::new(TracingNotifier::default());
        let sched = ReminderScheduler::new(notifier.clone(), settings());
        sched.sync_medication(&med(true), &DoseLog::in_memory(), at(2, 8, 0)).await;

        let occ = Occurrence::new("m1".to_owned(), at(2, 9, 0));
        let handle = sched.release_occurrence(&occ).await;
        assert!(sched.triggers_for(&occ).await.is_empty());
        assert_eq!(handle.await.unwrap().canceled, 6);
        assert_eq!(notifier.pending_count().await, 6);
        assert_eq!(sched.tracked_medications().await.len(), 1);
    }
}
