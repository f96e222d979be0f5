//! Durable storage backend shared between processes.
//!
//! The whole storage area is one JSON document at
//! `<base_dir>/<origin-slug>/storage.json`. A write holds an exclusive
//! advisory lock on `storage.lock` while it reads the current document,
//! changes one key and atomically replaces the file. Writers in any process
//! therefore never lose each other's keys, and the last write to a key wins.
//! Readers take no lock; the rename means they see either the old or the new
//! document.
//!
//! Other processes' writes are discovered by `sync()`, which diffs the file
//! against the last snapshot this handle observed.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ContextId, SharedStorage, StorageError, StorageEvent, EVENT_CHANNEL_CAPACITY};

/// Storage file name in the origin directory
const STORAGE_FILE: &str = "storage.json";

/// Writers serialize on this file, next to the storage file
const LOCK_FILE: &str = "storage.lock";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageDocument {
    #[serde(default)]
    entries: BTreeMap<String, String>,
    updated_at: Option<DateTime<Utc>>,
}

struct Inner {
    path: PathBuf,
    lock_path: PathBuf,
    /// Entries as last seen by this handle; guards the read-modify-write cycle.
    snapshot: Mutex<BTreeMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

/// Handle onto a file-backed storage area.
/// Clone is cheap and shares the snapshot and change channel.
#[derive(Clone)]
pub struct FileStorage {
    inner: Arc<Inner>,
    context: ContextId,
}

impl FileStorage {
    /// Open (creating if needed) the storage area for `origin` under `base_dir`.
    pub fn open(base_dir: &Path, origin: &str) -> Result<Self, StorageError> {
        let dir = base_dir.join(origin_slug(origin));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(STORAGE_FILE);
        let lock_path = dir.join(LOCK_FILE);

        let document = read_document(&path)?;
        debug!(path = %path.display(), keys = document.entries.len(), "Opened file storage");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                lock_path,
                snapshot: Mutex::new(document.entries),
                events,
            }),
            context: ContextId::next(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Re-read the file and publish one external event per key that changed
    /// since this handle last looked. Returns the number of events published.
    pub fn sync(&self) -> Result<usize, StorageError> {
        let mut snapshot = self.snapshot()?;
        let current = read_document(&self.inner.path)?.entries;

        let mut changes = Vec::new();
        for (key, value) in &current {
            if snapshot.get(key) != Some(value) {
                changes.push((key.clone(), snapshot.get(key).cloned(), Some(value.clone())));
            }
        }
        for (key, value) in snapshot.iter() {
            if !current.contains_key(key) {
                changes.push((key.clone(), Some(value.clone()), None));
            }
        }
        *snapshot = current;
        drop(snapshot);

        let count = changes.len();
        for (key, old_value, new_value) in changes {
            debug!(key = %key, "External storage change");
            let _ = self.inner.events.send(StorageEvent {
                key,
                old_value,
                new_value,
                origin: ContextId::EXTERNAL,
            });
        }
        Ok(count)
    }

    /// Poll the file for other processes' writes until the handle is aborted.
    pub fn spawn_watcher(&self, interval: Duration) -> JoinHandle<()> {
        let storage = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = storage.sync() {
                    warn!(error = %e, path = %storage.path().display(), "Failed to sync file storage");
                }
            }
        })
    }

    fn snapshot(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
        self.inner.snapshot.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Block until this handle holds the writer lock. Released on drop.
    fn lock_writers(&self) -> Result<File, StorageError> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.inner.lock_path)?;
        FileExt::lock_exclusive(&lock_file)?;
        Ok(lock_file)
    }

    /// Apply one key change to the document on disk and publish it.
    fn write_key(&self, key: &str, value: Option<&str>) -> Result<(), StorageError> {
        let mut snapshot = self.snapshot()?;
        let _lock = self.lock_writers()?;
        let mut document = read_document(&self.inner.path)?;

        let old = match value {
            Some(v) => document.entries.insert(key.to_string(), v.to_string()),
            None => document.entries.remove(key),
        };
        if old.as_deref() == value {
            return Ok(());
        }

        document.updated_at = Some(Utc::now());
        write_document(&self.inner.path, &document)?;

        match value {
            Some(v) => snapshot.insert(key.to_string(), v.to_string()),
            None => snapshot.remove(key),
        };
        drop(snapshot);

        let _ = self.inner.events.send(StorageEvent {
            key: key.to_string(),
            old_value: old,
            new_value: value.map(str::to_string),
            origin: self.context,
        });
        Ok(())
    }
}

impl SharedStorage for FileStorage {
    fn context(&self) -> ContextId {
        self.context
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(read_document(&self.inner.path)?.entries.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.write_key(key, Some(value))
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.write_key(key, None)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.events.subscribe()
    }
}

/// Turn an origin such as `http://localhost:8000` into a directory name.
fn origin_slug(origin: &str) -> String {
    let slug: String = origin
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    if slug.is_empty() {
        "default".to_string()
    } else {
        slug
    }
}

fn read_document(path: &Path) -> Result<StorageDocument, StorageError> {
    match std::fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(StorageDocument::default()),
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StorageDocument::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_document(path: &Path, document: &StorageDocument) -> Result<(), StorageError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let contents = serde_json::to_string_pretty(document)?;

    // Unique temp file in the same directory, renamed over the document
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
