//! Append-only log of taken doses, at most one event per occurrence.
//!
//! A file-backed log may be shared by several processes. Appends take a
//! `<log>.lock` file and re-read the log before checking for an existing
//! event, and every write replaces the file by renaming a finished copy
//! over it.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::NaiveDateTime;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::LogError;
use crate::model::{DoseEvent, Occurrence};


const LOCK_RETRY: StdDuration = StdDuration::from_millis(20);
const LOCK_ATTEMPTS: u32 = 100;
/// A lock file older than this was left behind by a crashed writer.
const STALE_LOCK: StdDuration = StdDuration::from_secs(10);


#[derive(Debug, Default)]
pub struct DoseLog {
    path: Option<PathBuf>,
    events: Mutex<BTreeMap<Occurrence, DoseEvent>>,
}

/// Exclusive right to write a log file, released on drop.
struct FileLock {
    path: PathBuf,
}


impl DoseLog {
    pub fn in_memory() -> DoseLog {
        DoseLog::default()
    }

    /// Opens a file-backed log, loading the events already in it.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<DoseLog, LogError> {
        let path = path.into();
        let by_occurrence = read_events(&path)?;
        debug!("loaded {} dose events from {:?}", by_occurrence.len(), path);

        Ok(DoseLog {
            path: Some(path),
            events: Mutex::new(by_occurrence),
        })
    }

    /// Re-reads the file, picking up events other processes appended.
    /// Returns the number of events now known.
    pub async fn refresh(&self) -> Result<usize, LogError> {
        let mut events = self.events.lock().await;
        if let Some(path) = &self.path {
            *events = read_events(path)?;
        }
        Ok(events.len())
    }

    /// Records `event` unless its occurrence already has one.
    ///
    /// The existence check, the insert and the file write happen under one
    /// lock, so concurrent appends for the same occurrence cannot both win.
    pub async fn append(&self, event: DoseEvent) -> Result<DoseEvent, LogError> {
        let occ = event.occurrence();
        let mut events = self.events.lock().await;
        let _file_lock = match &self.path {
            Some(path) => {
                let lock = FileLock::acquire(path).await?;
                *events = read_events(path)?;
                Some(lock)
            },
            None => None,
        };

        if events.contains_key(&occ) {
            return Err(LogError::AlreadyRecorded(occ.to_string()));
        }
        events.insert(occ.clone(), event.clone());

        if let Some(path) = &self.path {
            let all: Vec<&DoseEvent> = events.values().collect();
            if let Err(e) = write_events(path, &all) {
                events.remove(&occ);
                return Err(e);
            }
        }
        Ok(event)
    }

    pub async fn get(&self, occurrence: &Occurrence) -> Option<DoseEvent> {
        self.events.lock().await
            .get(occurrence)
            .cloned()
    }

    pub async fn events_for(&self, medication_id: &str) -> Vec<DoseEvent> {
        self.events.lock().await
            .values()
            .filter(|e| e.medication_id() == medication_id)
            .cloned()
            .collect()
    }

    /// Events whose scheduled time lies in `[from, to)`.
    pub async fn events_between(&self, from: NaiveDateTime, to: NaiveDateTime) -> Vec<DoseEvent> {
        self.events.lock().await
            .values()
            .filter(|e| from <= e.scheduled() && e.scheduled() < to)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

impl FileLock {
    async fn acquire(log_path: &Path) -> Result<FileLock, LogError> {
        let path = lock_path(log_path);
        for _ in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(FileLock { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!("removing stale dose log lock {:?}", path);
                        if let Err(e) = fs::remove_file(&path) {
                            debug!("stale lock {:?} already gone: {}", path, e);
                        }
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                },
                Err(e) => {
                    error!("failed to create dose log lock {:?}: {}", path, e);
                    return Err(LogError::Io(e.to_string()));
                },
            }
        }
        error!("dose log lock {:?} stayed taken", path);
        Err(LogError::Io(format!("dose log {:?} is locked by another writer", log_path)))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to release dose log lock {:?}: {}", self.path, e);
        }
    }
}


fn lock_path(log_path: &Path) -> PathBuf {
    let mut name = OsString::from(log_path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age > STALE_LOCK)
        .unwrap_or(false)
}

fn read_events(path: &Path) -> Result<BTreeMap<Occurrence, DoseEvent>, LogError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => {
            error!("failed to read dose log {:?}: {}", path, e);
            return Err(LogError::Io(e.to_string()));
        },
    };
    let events: Vec<DoseEvent> = serde_json::from_slice(&bytes)
        .map_err(|e| {
            error!("failed to load dose log {:?}: {}", path, e);
            LogError::Format(e.to_string())
        })?;

    let mut by_occurrence = BTreeMap::new();
    for ev in events {
        let occ = ev.occurrence();
        if by_occurrence.contains_key(&occ) {
            return Err(LogError::Format(format!("duplicate event for {}", occ)));
        }
        by_occurrence.insert(occ, ev);
    }
    Ok(by_occurrence)
}

fn write_events(path: &Path, events: &[&DoseEvent]) -> Result<(), LogError> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let io_error = |e: io::Error| {
        error!("failed to write dose log {:?}: {}", path, e);
        LogError::Io(e.to_string())
    };

    let mut staged = NamedTempFile::new_in(dir)
        .map_err(io_error)?;
    serde_json::to_writer_pretty(&mut staged, events)
        .map_err(|e| io_error(e.into()))?;
    staged.as_file().sync_all()
        .map_err(io_error)?;
    staged.persist(path)
        .map_err(|e| io_error(e.error))?;
    Ok(())
}
