//! Supply depletion and refill signals. All signals are recomputed from the
//! medication snapshot on read.

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::SupplyError;
use crate::model::{Medication, MedicationPatch};


pub const WARN_DAYS: u32 = 7;
pub const CRITICAL_DAYS: u32 = 3;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplySignal {
    None,
    Warn,
    Critical,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct SupplyStatus {
    pub current_supply: u32,
    pub total_supply: u32,
    /// Absent when the medication has no daily doses.
    pub remaining_days: Option<u32>,
    pub signal: SupplySignal,
    pub below_threshold: bool,
}


/// One dose less, never below zero and never above the total.
pub fn decrement(medication: &Medication) -> MedicationPatch {
    let current = medication.current_supply().min(medication.total_supply());
    MedicationPatch {
        current_supply: Some(current.saturating_sub(1)),
        ..Default::default()
    }
}

pub fn refill(medication: &Medication, now: NaiveDateTime) -> Result<MedicationPatch, SupplyError> {
    if medication.total_supply() == 0 {
        return Err(SupplyError::InvalidRefill(medication.id().to_owned()));
    }
    Ok(MedicationPatch {
        current_supply: Some(medication.total_supply()),
        last_refill_date: Some(now),
    })
}

pub fn remaining_days(medication: &Medication) -> Option<u32> {
    // how many days will it last?
    match medication.doses_per_day() {
        0 => None,
        per_day => Some(medication.current_supply() / per_day),
    }
}

pub fn status(medication: &Medication) -> SupplyStatus {
    let remaining = remaining_days(medication);
    let signal = match remaining {
        Some(d) if d <= CRITICAL_DAYS => SupplySignal::Critical,
        Some(d) if d <= WARN_DAYS => SupplySignal::Warn,
        _ => SupplySignal::None,
    };
    let below_threshold = medication.total_supply() > 0
        && u64::from(medication.current_supply()) * 100
            <= u64::from(medication.refill_threshold()) * u64::from(medication.total_supply());

    SupplyStatus {
        current_supply: medication.current_supply(),
        total_supply: medication.total_supply(),
        remaining_days: remaining,
        signal,
        below_threshold,
    }
}
