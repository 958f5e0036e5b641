//! The local notification collaborator.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use derive_new::new;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::NotifyError;
use crate::model::Occurrence;


#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TriggerId(pub String);

/// What a reminder shows when it fires.
#[derive(Clone, Debug, Deserialize, Eq, Hash, new, PartialEq, Serialize)]
pub struct ReminderPayload {
    occurrence: Occurrence,
    medication_name: String,
    dosage: String,
    /// Minutes past the scheduled time at which this trigger fires.
    offset_minutes: i64,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn schedule(&self, trigger_time: NaiveDateTime, payload: ReminderPayload) -> Result<TriggerId, NotifyError>;
    async fn cancel(&self, trigger_id: &TriggerId) -> Result<(), NotifyError>;
}

/// Keeps pending triggers in memory and logs them when they come due.
#[derive(Debug, Default)]
pub struct TracingNotifier {
    next_id: AtomicU64,
    pending: Mutex<BTreeMap<TriggerId, (NaiveDateTime, ReminderPayload)>>,
}


impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ReminderPayload {
    pub fn occurrence(&self) -> &Occurrence { &self.occurrence }
    pub fn medication_name(&self) -> &str { &self.medication_name }
    pub fn dosage(&self) -> &str { &self.dosage }
    pub fn offset_minutes(&self) -> i64 { self.offset_minutes }

    pub fn message(&self) -> String {
        if self.offset_minutes == 0 {
            format!("Time to take {} ({})", self.medication_name, self.dosage)
        } else {
            format!(
                "Reminder: {} ({}) was due {} minutes ago",
                self.medication_name, self.dosage, self.offset_minutes,
            )
        }
    }
}

impl TracingNotifier {
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Removes and returns every trigger whose time has come.
    pub async fn take_due(&self, now: NaiveDateTime) -> Vec<(TriggerId, ReminderPayload)> {
        let mut pending = self.pending.lock().await;
        let due_ids: Vec<TriggerId> = pending.iter()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        due_ids.into_iter()
            .filter_map(|id| pending.remove(&id).map(|(_, payload)| (id, payload)))
            .collect()
    }
}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn schedule(&self, trigger_time: NaiveDateTime, payload: ReminderPayload) -> Result<TriggerId, NotifyError> {
        let id = TriggerId(format!("t{}", self.next_id.fetch_add(1, Ordering::Relaxed)));
        debug!("scheduled {} at {} for {}", id, trigger_time, payload.occurrence());
        self.pending.lock().await
            .insert(id.clone(), (trigger_time, payload));
        Ok(id)
    }

    async fn cancel(&self, trigger_id: &TriggerId) -> Result<(), NotifyError> {
        if self.pending.lock().await.remove(trigger_id).is_some() {
            debug!("canceled {}", trigger_id);
        } else {
            info!("trigger {} was not pending", trigger_id);
        }
        Ok(())
    }
}
