//! Local snapshot store.
//!
//! Synchronous, best-effort persistence of draft snapshots. Writes go to a
//! primary backend (LMDB) and fall back to a secondary backend (one file per
//! key) when the primary fails. Nothing in here ever returns an error to the
//! caller: the store is a safety net, the remote copy is the source of truth.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use lmdb::{Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::snapshot_model::{DocumentKey, Snapshot};

const SNAPSHOT_DB_NAME: &str = "snapshots";

/// Raw key-value storage used by [`SnapshotStore`].
pub trait SnapshotBackend: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns `true` if an entry was removed.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Removes every entry.
    fn clear_all(&self) -> Result<(), StoreError>;

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ============================================================================
// LMDB (primary)
// ============================================================================

struct LmdbHandle {
    env: Environment,
    db: Database,
}

/// LMDB-backed snapshot storage. The environment lives in `<path>.lmdb/`.
pub struct LmdbBackend {
    dir: PathBuf,
    handle: RwLock<Option<LmdbHandle>>,
}

impl LmdbBackend {
    pub fn init(path: impl AsRef<Path>, map_size: usize) -> Result<Self, StoreError> {
        let dir = lmdb_dir(path.as_ref());
        fs::create_dir_all(&dir)?;

        let env = Environment::new()
            .set_max_dbs(4)
            .set_map_size(map_size)
            .open(&dir)?;
        let db = env.create_db(Some(SNAPSHOT_DB_NAME), DatabaseFlags::empty())?;

        info!("Opened snapshot environment at {}", dir.display());
        Ok(Self {
            dir,
            handle: RwLock::new(Some(LmdbHandle { env, db })),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Closes the environment and deletes it from disk.
    pub fn destroy(&self) -> Result<(), StoreError> {
        self.close()?;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn lmdb_dir(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lmdb");
    PathBuf::from(name)
}

impl SnapshotBackend for LmdbBackend {
    fn name(&self) -> &'static str {
        "lmdb"
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let guard = self.handle.read();
        let handle = guard.as_ref().ok_or(StoreError::Closed)?;

        let mut txn = handle.env.begin_rw_txn()?;
        txn.put(handle.db, &key, &bytes, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.handle.read();
        let handle = guard.as_ref().ok_or(StoreError::Closed)?;

        let txn = handle.env.begin_ro_txn()?;
        let result = match txn.get(handle.db, &key) {
            Ok(bytes) => Ok(Some(bytes.to_vec())),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        };
        txn.abort();
        result
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let guard = self.handle.read();
        let handle = guard.as_ref().ok_or(StoreError::Closed)?;

        let mut txn = handle.env.begin_rw_txn()?;
        match txn.del(handle.db, &key, None) {
            Ok(()) => {
                txn.commit()?;
                Ok(true)
            }
            Err(lmdb::Error::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        let guard = self.handle.read();
        let handle = guard.as_ref().ok_or(StoreError::Closed)?;

        let mut txn = handle.env.begin_rw_txn()?;
        txn.clear_db(handle.db)?;
        txn.commit()?;
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        if let Some(handle) = self.handle.write().take() {
            handle.env.sync(true)?;
            info!("Closed snapshot environment at {}", self.dir.display());
        }
        Ok(())
    }
}

// ============================================================================
// Files (fallback)
// ============================================================================

/// One file per key. Used when the primary store rejects a write.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn init(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // One flat file per key.
        self.dir.join(format!("{}.json", urlencoding::encode(key)))
    }
}

impl SnapshotBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Memory
// ============================================================================

/// In-process map with an optional byte quota.
///
/// Useful for hosts without a writable filesystem and for exercising the
/// fallback path: a write that would exceed the quota fails with
/// [`StoreError::QuotaExceeded`].
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    quota: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota: Some(quota),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SnapshotBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if let Some(quota) = self.quota {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = key.len() + bytes.len();
            if used + needed > quota {
                return Err(StoreError::QuotaExceeded {
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }
        entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        self.entries.lock().clear();
        Ok(())
    }
}

// ============================================================================
// SnapshotStore
// ============================================================================

/// Per-feature snapshot store over a primary and a fallback backend.
///
/// Keys are namespaced as `<feature>_backup_<documentKey>`; every document
/// key owns exactly one slot, so independent documents never contend.
pub struct SnapshotStore {
    feature: String,
    primary: Box<dyn SnapshotBackend>,
    fallback: Box<dyn SnapshotBackend>,
}

impl SnapshotStore {
    pub fn new(
        feature: impl Into<String>,
        primary: Box<dyn SnapshotBackend>,
        fallback: Box<dyn SnapshotBackend>,
    ) -> Self {
        Self {
            feature: feature.into(),
            primary,
            fallback,
        }
    }

    /// LMDB primary at `config.path`, file fallback next to it.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let primary = LmdbBackend::init(&config.path, config.map_size)?;
        let fallback = FileBackend::init(config.fallback_dir())?;
        Ok(Self::new(
            config.feature.clone(),
            Box::new(primary),
            Box::new(fallback),
        ))
    }

    pub fn in_memory(feature: impl Into<String>) -> Self {
        Self::new(
            feature,
            Box::new(MemoryBackend::new()),
            Box::new(MemoryBackend::new()),
        )
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// Writes a fresh snapshot of `data` under `key`. Never fails.
    pub fn save<D: Serialize>(&self, key: &DocumentKey, data: &D) {
        let storage_key = key.storage_key(&self.feature);
        let bytes = match serde_json::to_vec(&Snapshot::new(data)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not serialize snapshot for {storage_key}: {e}");
                return;
            }
        };

        match self.primary.write(&storage_key, &bytes) {
            Ok(()) => {
                // Keep a single copy per key.
                if let Err(e) = self.fallback.remove(&storage_key) {
                    debug!("Could not drop fallback copy of {storage_key}: {e}");
                }
            }
            Err(primary_err) => {
                warn!(
                    "Primary {} write failed for {storage_key}: {primary_err}; trying {}",
                    self.primary.name(),
                    self.fallback.name()
                );
                match self.fallback.write(&storage_key, &bytes) {
                    Ok(()) => {
                        if let Err(e) = self.primary.remove(&storage_key) {
                            debug!("Could not drop stale primary copy of {storage_key}: {e}");
                        }
                    }
                    Err(e) => {
                        warn!("Fallback write failed for {storage_key}, snapshot dropped: {e}")
                    }
                }
            }
        }
    }

    /// Returns the newest readable snapshot for `key`, or `None`.
    ///
    /// Missing, corrupt and foreign-version entries are all treated as absent.
    pub fn load<D: DeserializeOwned>(&self, key: &DocumentKey) -> Option<Snapshot<D>> {
        let storage_key = key.storage_key(&self.feature);
        let primary = read_snapshot::<D>(self.primary.as_ref(), &storage_key);
        let fallback = read_snapshot::<D>(self.fallback.as_ref(), &storage_key);

        match (primary, fallback) {
            (Some(p), Some(f)) => {
                if f.taken_at() > p.taken_at() {
                    Some(f)
                } else {
                    Some(p)
                }
            }
            (Some(p), None) => Some(p),
            (None, f) => f,
        }
    }

    /// Removes the snapshot for `key` from both backends. Idempotent.
    pub fn clear(&self, key: &DocumentKey) {
        let storage_key = key.storage_key(&self.feature);
        for backend in [self.primary.as_ref(), self.fallback.as_ref()] {
            if let Err(e) = backend.remove(&storage_key) {
                warn!("Could not clear {storage_key} from {}: {e}", backend.name());
            }
        }
    }

    /// Drops every snapshot in both backends. Returns `false` if either
    /// backend could not be cleared.
    pub fn clear_all(&self) -> bool {
        let mut cleared = true;
        for backend in [self.primary.as_ref(), self.fallback.as_ref()] {
            if let Err(e) = backend.clear_all() {
                warn!("Could not clear {} backend: {e}", backend.name());
                cleared = false;
            }
        }
        cleared
    }

    pub fn close(&self) {
        for backend in [self.primary.as_ref(), self.fallback.as_ref()] {
            if let Err(e) = backend.close() {
                warn!("Could not close {} backend: {e}", backend.name());
            }
        }
    }
}

fn read_snapshot<D: DeserializeOwned>(
    backend: &dyn SnapshotBackend,
    storage_key: &str,
) -> Option<Snapshot<D>> {
    let bytes = match backend.read(storage_key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(e) => {
            warn!("Could not read {storage_key} from {}: {e}", backend.name());
            return None;
        }
    };

    match serde_json::from_slice::<Snapshot<D>>(&bytes) {
        Ok(snapshot) if snapshot.is_current_version() => Some(snapshot),
        Ok(snapshot) => {
            warn!(
                "Ignoring {storage_key} from {}: unsupported version {}",
                backend.name(),
                snapshot.version
            );
            None
        }
        Err(e) => {
            warn!("Ignoring corrupt {storage_key} from {}: {e}", backend.name());
            None
        }
    }
}
