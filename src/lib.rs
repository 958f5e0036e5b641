//! Dose scheduling and adherence tracking.
//!
//! Medications come from a [`store::MedicationStore`]; their times of day
//! are expanded into occurrences ([`schedule`]), labeled at read time
//! ([`window`]), confirmed into an append-only [`dose_log`], and summarized
//! as adherence ([`adherence`]) and supply ([`supply`]) figures. Reminders
//! are kept in step with a [`notify::Notifier`] by [`reminders`].

pub mod adherence;
pub mod confirm;
pub mod dose_log;
pub mod engine;
pub mod error;
pub mod model;
pub mod notify;
pub mod reminders;
pub mod schedule;
pub mod store;
pub mod supply;
mod util;
pub mod window;


pub use crate::adherence::AdherenceStats;
pub use crate::dose_log::DoseLog;
pub use crate::engine::Engine;
pub use crate::error::{ConfirmError, NotifyError, QueryError, ScheduleError, StoreError, SupplyError};
pub use crate::model::{Config, DoseEvent, EngineSettings, Medication, MedicationPatch, Occurrence, TimeOfDay, Timing};
pub use crate::schedule::DateRange;
pub use crate::supply::{SupplySignal, SupplyStatus};
pub use crate::window::DoseState;
