//! The in-process boundary the UI talks to.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, error, info, warn};

use crate::adherence::{self, AdherenceStats};
use crate::confirm::ConfirmationHandler;
use crate::dose_log::DoseLog;
use crate::error::{ConfirmError, QueryError, ScheduleError, StoreError, SupplyError};
use crate::model::{DoseEvent, EngineSettings, Medication, Occurrence};
use crate::notify::Notifier;
use crate::reminders::{ReminderScheduler, SyncReport};
use crate::schedule::{occurrences, DateRange};
use crate::store::MedicationStore;
use crate::supply::{self, SupplyStatus};
use crate::util::bounded;
use crate::window::{classify, DoseState};


pub struct Engine {
    user_id: String,
    store: Arc<dyn MedicationStore>,
    log: Arc<DoseLog>,
    settings: EngineSettings,
    confirmations: ConfirmationHandler,
    reminders: ReminderScheduler,
}


impl Engine {
    pub fn new(
        user_id: String,
        store: Arc<dyn MedicationStore>,
        notifier: Arc<dyn Notifier>,
        log: Arc<DoseLog>,
        settings: EngineSettings,
    ) -> Engine {
        Engine {
            user_id,
            confirmations: ConfirmationHandler::new(store.clone(), log.clone(), settings),
            reminders: ReminderScheduler::new(notifier, settings),
            store,
            log,
            settings,
        }
    }

    pub fn log(&self) -> &DoseLog { &self.log }
    pub fn reminders(&self) -> &ReminderScheduler { &self.reminders }

    /// Checks a medication record before it is created or saved.
    pub fn validate_medication(medication: &Medication) -> Result<(), ScheduleError> {
        medication.validate()
    }

    /// Every occurrence of the user's active medications in `range`, with its state at `now`.
    pub async fn occurrences_for(&self, range: DateRange, now: NaiveDateTime) -> Result<Vec<(Occurrence, DoseState)>, QueryError> {
        let mut listed = Vec::new();
        for med in self.schedulable_medications().await? {
            for occ in occurrences(&med, range)? {
                let event = self.log.get(&occ).await;
                let state = classify(occ.scheduled(), now, event.as_ref());
                listed.push((occ, state));
            }
        }
        listed.sort_by(|(a, _), (b, _)| a.scheduled().cmp(&b.scheduled()).then_with(|| a.cmp(b)));
        Ok(listed)
    }

    /// Records a taken dose, then cancels the occurrence's remaining reminders.
    ///
    /// The reminders stop being live before this returns. Waiting on the
    /// backend cancellation is bounded by one collaborator timeout; past
    /// that it carries on in the background.
    pub async fn confirm(&self, occurrence: &Occurrence, confirmed_at: NaiveDateTime) -> Result<DoseEvent, ConfirmError> {
        let event = self.confirmations.confirm(occurrence, confirmed_at).await?;
        let canceling = self.reminders.release_occurrence(occurrence).await;
        match tokio::time::timeout(self.settings.collaborator_timeout, canceling).await {
            Ok(Ok(report)) if report.cancel_failures > 0 => {
                warn!("{} reminders of {} could not be canceled", report.cancel_failures, occurrence);
            },
            Ok(Ok(_)) => {},
            Ok(Err(e)) => warn!("canceling reminders of {} aborted: {}", occurrence, e),
            Err(_elapsed) => debug!("reminders of {} are still being canceled", occurrence),
        }
        Ok(event)
    }

    pub async fn adherence_stats(&self, range: DateRange, now: NaiveDateTime) -> Result<AdherenceStats, QueryError> {
        let meds = self.schedulable_medications().await?;
        let events = self.events_in(range).await;
        Ok(adherence::adherence(&meds, &events, range, now)?)
    }

    pub async fn adherence_by_medication(&self, range: DateRange, now: NaiveDateTime) -> Result<BTreeMap<String, AdherenceStats>, QueryError> {
        let meds = self.schedulable_medications().await?;
        let events = self.events_in(range).await;
        Ok(adherence::adherence_by_medication(&meds, &events, range, now)?)
    }

    pub async fn supply_status(&self, medication_id: &str) -> Result<SupplyStatus, SupplyError> {
        let med = bounded(
            self.settings.collaborator_timeout,
            self.store.get(medication_id),
            StoreError::Timeout,
        ).await?;
        Ok(supply::status(&med))
    }

    pub async fn refill(&self, medication_id: &str, now: NaiveDateTime) -> Result<SupplyStatus, SupplyError> {
        let updated = self.confirmations.refill(medication_id, now).await?;
        Ok(supply::status(&updated))
    }

    /// Rebuilds a medication's reminders after an edit.
    ///
    /// An edit that leaves the schedule malformed still cancels the old
    /// reminders before the error is returned.
    pub async fn medication_changed(&self, medication_id: &str, now: NaiveDateTime) -> Result<SyncReport, QueryError> {
        let med = bounded(
            self.settings.collaborator_timeout,
            self.store.get(medication_id),
            StoreError::Timeout,
        ).await?;
        if let Err(e) = med.validate() {
            self.reminders.cancel_medication(medication_id).await;
            return Err(e.into());
        }
        Ok(self.reminders.sync_medication(&med, &self.log, now).await)
    }

    pub async fn medication_deleted(&self, medication_id: &str) -> SyncReport {
        let report = self.reminders.cancel_medication(medication_id).await;
        info!("medication {} deleted, {} reminders canceled", medication_id, report.canceled);
        report
    }

    /// Re-syncs reminders for every active medication of the user.
    ///
    /// Reminders of medications that were removed, deactivated or broken
    /// since the last sync are canceled.
    pub async fn sync_reminders(&self, now: NaiveDateTime) -> Result<SyncReport, QueryError> {
        let meds = self.schedulable_medications().await?;
        let listed: BTreeSet<&str> = meds.iter()
            .map(|m| m.id())
            .collect();

        let mut total = SyncReport::default();
        for med_id in self.reminders.tracked_medications().await {
            if !listed.contains(med_id.as_str()) {
                info!("medication {} is no longer scheduled, dropping its reminders", med_id);
                total.absorb(self.reminders.cancel_medication(&med_id).await);
            }
        }
        for med in &meds {
            total.absorb(self.reminders.sync_medication(med, &self.log, now).await);
        }
        Ok(total)
    }

    /// Periodic housekeeping: forget closed windows, then refresh reminders.
    pub async fn tick(&self, now: NaiveDateTime) -> Result<SyncReport, QueryError> {
        let pruned = self.reminders.prune_expired(now).await;
        if pruned > 0 {
            debug!("pruned {} expired occurrences", pruned);
        }
        self.sync_reminders(now).await
    }

    async fn schedulable_medications(&self) -> Result<Vec<Medication>, StoreError> {
        let meds = bounded(
            self.settings.collaborator_timeout,
            self.store.list(&self.user_id),
            StoreError::Timeout,
        ).await
            .map_err(|e| {
                error!("failed to list medications of {}: {}", self.user_id, e);
                e
            })?;

        let usable = meds.into_iter()
            .filter(|m| m.active())
            .filter(|m| match m.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!("skipping medication: {}", e);
                    false
                },
            })
            .collect();
        Ok(usable)
    }

    async fn events_in(&self, range: DateRange) -> Vec<DoseEvent> {
        let from = range.start().and_hms_opt(0, 0, 0);
        let to = range.end().and_hms_opt(0, 0, 0);
        match (from, to) {
            (Some(f), Some(t)) => self.log.events_between(f, t).await,
            _ => Vec::new(),
        }
    }
}
