use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{Action, ChangeEvent, Entity, HistoryId, Severity};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: HistoryId,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub entity: Entity,
    pub action: Action,
    pub actor_name: String,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub entity_id: Option<i64>,
    pub read: bool,
    pub received_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_event(
        event: &ChangeEvent,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            severity,
            title: title.into(),
            message: message.into(),
            entity: event.entity.clone(),
            action: event.action.clone(),
            actor_name: event.actor_name.clone(),
            details: event.details.clone(),
            entity_id: event.entity_id,
            read: false,
            received_at: Utc::now(),
        }
    }
}

/// Durable slot holding the serialized history list.
pub trait HistoryBackend: Send + Sync {
    fn load(&self) -> Result<Option<String>, HistoryError>;
    fn save(&self, payload: &str) -> Result<(), HistoryError>;
}

pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HistoryBackend for FileBackend {
    fn load(&self) -> Result<Option<String>, HistoryError> {
        match fs::read_to_string(&self.path) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, payload: &str) -> Result<(), HistoryError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(payload: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(payload.into()))),
        }
    }

    pub fn payload(&self) -> Option<String> {
        self.slot.lock().clone()
    }
}

impl HistoryBackend for MemoryBackend {
    fn load(&self) -> Result<Option<String>, HistoryError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, payload: &str) -> Result<(), HistoryError> {
        *self.slot.lock() = Some(payload.to_string());
        Ok(())
    }
}

/// Serializes snapshot writes to the backend. Snapshots are numbered when
/// taken; a write older than the last one stored is skipped.
struct Persister {
    backend: Arc<dyn HistoryBackend>,
    save_lock: Mutex<()>,
    issued: AtomicU64,
    written: AtomicU64,
}

impl Persister {
    fn new(backend: Arc<dyn HistoryBackend>) -> Self {
        Self {
            backend,
            save_lock: Mutex::new(()),
            issued: AtomicU64::new(0),
            written: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn write(&self, seq: u64, payload: &str) {
        let _guard = self.save_lock.lock();
        if seq <= self.written.load(Ordering::SeqCst) {
            debug!(seq, "skipping stale history snapshot");
            return;
        }
        if let Err(e) = self.backend.save(payload) {
            warn!(error = %e, "failed to persist notification history");
        }
        self.written.store(seq, Ordering::SeqCst);
    }
}

/// Capped, newest-first log of past change events.
///
/// The in-memory list is authoritative; every mutation is written through to
/// the backend and a failed write is logged, never returned. Inside a tokio
/// runtime the write runs on the blocking pool. Loading at `open` is
/// synchronous.
#[derive(Clone)]
pub struct HistoryStore {
    cap: usize,
    entries: Arc<watch::Sender<Vec<HistoryEntry>>>,
    persister: Arc<Persister>,
    write_lock: Arc<Mutex<()>>,
}

impl HistoryStore {
    pub fn open(backend: Arc<dyn HistoryBackend>, cap: usize) -> Self {
        let entries = rehydrate(backend.as_ref(), cap);
        debug!(count = entries.len(), "notification history rehydrated");

        let (entries, _) = watch::channel(entries);
        Self {
            cap,
            entries: Arc::new(entries),
            persister: Arc::new(Persister::new(backend)),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn append(&self, entry: HistoryEntry) {
        let _guard = self.write_lock.lock();
        let cap = self.cap;
        self.entries.send_modify(|list| {
            list.insert(0, entry);
            list.truncate(cap);
        });
        self.persist();
    }

    pub fn mark_read(&self, id: HistoryId) -> bool {
        let _guard = self.write_lock.lock();
        let changed = self.entries.send_if_modified(|list| {
            match list.iter_mut().find(|e| e.id == id) {
                Some(entry) if !entry.read => {
                    entry.read = true;
                    true
                }
                _ => false,
            }
        });
        if changed {
            self.persist();
        }
        changed
    }

    pub fn mark_all_read(&self) -> usize {
        let _guard = self.write_lock.lock();
        let mut flipped = 0;
        self.entries.send_if_modified(|list| {
            for entry in list.iter_mut().filter(|e| !e.read) {
                entry.read = true;
                flipped += 1;
            }
            flipped > 0
        });
        if flipped > 0 {
            self.persist();
        }
        flipped
    }

    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.entries.send_modify(|list| list.clear());
        self.persist();
    }

    pub fn unread_count(&self) -> usize {
        self.entries.borrow().iter().filter(|e| !e.read).count()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<HistoryEntry>> {
        self.entries.subscribe()
    }

    // Caller holds write_lock, so snapshot order matches mutation order.
    fn persist(&self) {
        let payload = {
            let list = self.entries.borrow();
            serde_json::to_string(&*list)
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize notification history");
                return;
            }
        };

        let seq = self.persister.next_seq();
        match Handle::try_current() {
            Ok(runtime) => {
                let persister = self.persister.clone();
                runtime.spawn_blocking(move || persister.write(seq, &payload));
            }
            Err(_) => self.persister.write(seq, &payload),
        }
    }
}

fn rehydrate(backend: &dyn HistoryBackend, cap: usize) -> Vec<HistoryEntry> {
    let payload = match backend.load() {
        Ok(Some(payload)) => payload,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(error = %e, "failed to load notification history, starting empty");
            return Vec::new();
        }
    };

    match serde_json::from_str::<Vec<HistoryEntry>>(&payload) {
        Ok(mut entries) => {
            entries.truncate(cap);
            entries
        }
        Err(e) => {
            warn!(error = %e, "corrupt notification history, starting empty");
            Vec::new()
        }
    }
}
