//! Recording "taken" confirmations.
//!
//! A confirmation is accepted only inside its window, at most once per
//! occurrence, and always lands in the dose log before supply is touched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::dose_log::DoseLog;
use crate::error::{ConfirmError, StoreError, SupplyError};
use crate::model::{DoseEvent, EngineSettings, Medication, Occurrence, Timing};
use crate::schedule::is_scheduled;
use crate::store::MedicationStore;
use crate::supply;
use crate::util::bounded;
use crate::window::{late_end, timing_of};


pub struct ConfirmationHandler {
    store: Arc<dyn MedicationStore>,
    log: Arc<DoseLog>,
    settings: EngineSettings,
    medication_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}


/// The instants `[opens, closes]` in which `scheduled` may be confirmed.
pub fn confirmation_window(scheduled: NaiveDateTime, early_window: Duration) -> (NaiveDateTime, NaiveDateTime) {
    (scheduled - early_window, scheduled + late_end())
}

pub fn check_window(scheduled: NaiveDateTime, confirmed_at: NaiveDateTime, early_window: Duration) -> Result<Timing, ConfirmError> {
    let (opens, closes) = confirmation_window(scheduled, early_window);
    if confirmed_at < opens || confirmed_at > closes {
        return Err(ConfirmError::OutOfWindow { confirmed_at, opens, closes });
    }
    Ok(timing_of(scheduled, confirmed_at))
}


impl ConfirmationHandler {
    pub fn new(store: Arc<dyn MedicationStore>, log: Arc<DoseLog>, settings: EngineSettings) -> ConfirmationHandler {
        ConfirmationHandler {
            store,
            log,
            settings,
            medication_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Records `occurrence` as taken at `confirmed_at` and takes one dose off
    /// the supply.
    ///
    /// A failed supply update is logged but does not undo the confirmation;
    /// the dose log is authoritative.
    pub async fn confirm(&self, occurrence: &Occurrence, confirmed_at: NaiveDateTime) -> Result<DoseEvent, ConfirmError> {
        let timing = match check_window(occurrence.scheduled(), confirmed_at, self.settings.early_window) {
            Ok(t) => t,
            Err(e) => {
                info!("rejected confirmation of {}: {}", occurrence, e);
                return Err(e);
            },
        };

        let lock = self.medication_lock(occurrence.medication_id()).await;
        let _guard = lock.lock().await;

        let medication = self.fetch(occurrence.medication_id()).await?;
        if !medication.active() {
            return Err(ConfirmError::UnknownMedication(medication.id().to_owned()));
        }
        if !is_scheduled(&medication, occurrence.scheduled())? {
            return Err(ConfirmError::UnknownOccurrence(occurrence.to_string()));
        }

        let event = DoseEvent::new(
            occurrence.medication_id().to_owned(),
            occurrence.scheduled(),
            confirmed_at,
            timing,
        );
        let event = match self.log.append(event).await {
            Ok(ev) => ev,
            Err(e) => {
                info!("rejected confirmation of {}: {}", occurrence, e);
                return Err(e.into());
            },
        };
        info!("recorded {} as taken ({})", occurrence, timing);

        let patch = supply::decrement(&medication);
        let res = bounded(
            self.settings.collaborator_timeout,
            self.store.update(medication.id(), &patch),
            StoreError::Timeout,
        ).await;
        match res {
            Ok(updated) => debug!("supply of {} now {}", updated.id(), updated.current_supply()),
            Err(e) => warn!("dose recorded but supply of {} not updated: {}", medication.id(), e),
        }

        Ok(event)
    }

    /// Resets supply to the total, serialized with confirmations of the same medication.
    pub async fn refill(&self, medication_id: &str, now: NaiveDateTime) -> Result<Medication, SupplyError> {
        let lock = self.medication_lock(medication_id).await;
        let _guard = lock.lock().await;

        let medication = bounded(
            self.settings.collaborator_timeout,
            self.store.get(medication_id),
            StoreError::Timeout,
        ).await?;
        let patch = supply::refill(&medication, now)?;
        let updated = bounded(
            self.settings.collaborator_timeout,
            self.store.update(medication_id, &patch),
            StoreError::Timeout,
        ).await?;
        info!("refilled {} to {}", medication_id, updated.current_supply());
        Ok(updated)
    }

    async fn fetch(&self, medication_id: &str) -> Result<Medication, ConfirmError> {
        let med = bounded(
            self.settings.collaborator_timeout,
            self.store.get(medication_id),
            StoreError::Timeout,
        ).await?;
        Ok(med)
    }

    async fn medication_lock(&self, medication_id: &str) -> Arc<Mutex<()>> {
        self.medication_locks.lock().await
            .entry(medication_id.to_owned())
            .or_default()
            .clone()
    }
}
