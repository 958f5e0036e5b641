//! The medication persistence collaborator.
//!
//! The engine only ever holds snapshots; every change goes back through
//! [`MedicationStore::update`].

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::error::StoreError;
use crate::model::{Medication, MedicationPatch};


#[async_trait]
pub trait MedicationStore: Send + Sync {
    async fn get(&self, medication_id: &str) -> Result<Medication, StoreError>;
    async fn list(&self, user_id: &str) -> Result<Vec<Medication>, StoreError>;
    async fn update(&self, medication_id: &str, patch: &MedicationPatch) -> Result<Medication, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    medications: RwLock<BTreeMap<String, Medication>>,
}

/// Keeps all medications in one pretty-printed JSON array.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: RwLock<()>,
}


impl MemoryStore {
    pub fn new(medications: Vec<Medication>) -> MemoryStore {
        let by_id = medications.into_iter()
            .map(|m| (m.id().to_owned(), m))
            .collect();
        MemoryStore {
            medications: RwLock::new(by_id),
        }
    }

    pub async fn insert(&self, medication: Medication) {
        self.medications.write().await
            .insert(medication.id().to_owned(), medication);
    }

    pub async fn remove(&self, medication_id: &str) -> Option<Medication> {
        self.medications.write().await
            .remove(medication_id)
    }
}

#[async_trait]
impl MedicationStore for MemoryStore {
    async fn get(&self, medication_id: &str) -> Result<Medication, StoreError> {
        self.medications.read().await
            .get(medication_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(medication_id.to_owned()))
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Medication>, StoreError> {
        let meds = self.medications.read().await
            .values()
            .filter(|m| m.user_id() == user_id)
            .cloned()
            .collect();
        Ok(meds)
    }

    async fn update(&self, medication_id: &str, patch: &MedicationPatch) -> Result<Medication, StoreError> {
        let mut guard = self.medications.write().await;
        let med = guard.get_mut(medication_id)
            .ok_or_else(|| StoreError::NotFound(medication_id.to_owned()))?;
        med.apply(patch);
        Ok(med.clone())
    }
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> JsonFileStore {
        JsonFileStore {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    fn load_data(&self) -> Result<Vec<Medication>, StoreError> {
        let reader = match File::open(&self.path) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no medication file at {:?} yet", self.path);
                return Ok(Vec::new());
            },
            Err(e) => {
                error!("failed to open medication file {:?}: {}", self.path, e);
                return Err(StoreError::Io(e.to_string()));
            },
        };

        serde_json::from_reader(reader)
            .map_err(|e| {
                error!("failed to load medications from {:?}: {}", self.path, e);
                StoreError::Format(e.to_string())
            })
    }

    fn store_data(&self, data: &[Medication]) -> Result<(), StoreError> {
        let writer = File::create(&self.path)
            .map_err(|e| {
                error!("failed to create medication file {:?}: {}", self.path, e);
                StoreError::Io(e.to_string())
            })?;

        serde_json::to_writer_pretty(writer, data)
            .map_err(|e| {
                error!("failed to store medications to {:?}: {}", self.path, e);
                StoreError::Io(e.to_string())
            })
    }
}

#[async_trait]
impl MedicationStore for JsonFileStore {
    async fn get(&self, medication_id: &str) -> Result<Medication, StoreError> {
        let _guard = self.lock.read().await;
        self.load_data()?
            .into_iter()
            .find(|m| m.id() == medication_id)
            .ok_or_else(|| StoreError::NotFound(medication_id.to_owned()))
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Medication>, StoreError> {
        let _guard = self.lock.read().await;
        let meds = self.load_data()?
            .into_iter()
            .filter(|m| m.user_id() == user_id)
            .collect();
        Ok(meds)
    }

    async fn update(&self, medication_id: &str, patch: &MedicationPatch) -> Result<Medication, StoreError> {
        let _guard = self.lock.write().await;
        let mut data = self.load_data()?;
        let updated = {
            let med = data.iter_mut()
                .find(|m| m.id() == medication_id)
                .ok_or_else(|| StoreError::NotFound(medication_id.to_owned()))?;
            med.apply(patch);
            med.clone()
        };
        self.store_data(&data)?;
        Ok(updated)
    }
}
