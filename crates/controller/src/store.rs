//! In-memory record store with change notifications and an optional status
//! snapshot file.
//!
//! Desired state is pushed in with [`MemoryStore::apply`] and
//! [`MemoryStore::remove`]; the reconciler writes observed state through the
//! [`RecordStore`] port. Every spec change bumps the record's generation and
//! is announced on a broadcast channel the scheduler follows.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use polling::{Generation, PolledRepository, RecordKey, RecordStore, RepositoryStatus, StoreError, WatchedRepository};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// A desired-state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A record was created or its spec changed.
    Applied { key: RecordKey, generation: Generation },
    /// A record was removed.
    Deleted { key: RecordKey },
}

#[derive(Default)]
struct Records {
    live: BTreeMap<RecordKey, PolledRepository>,
    /// Records restored from a snapshot, waiting for their spec to be applied.
    restored: HashMap<RecordKey, PolledRepository>,
}

pub struct MemoryStore {
    records: RwLock<Records>,
    events: broadcast::Sender<StoreEvent>,
    snapshot: Option<PathBuf>,
    /// Serialises snapshot writes so the file always holds the latest state.
    snapshot_lock: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store that keeps status in memory only.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            records: RwLock::new(Records::default()),
            events,
            snapshot: None,
            snapshot_lock: Mutex::new(()),
        }
    }

    /// A store that writes every status change to `path` and restores from it.
    ///
    /// A missing file is an empty snapshot.
    pub async fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let restored = load_snapshot(&path).await?;
        info!(path = %path.display(), records = restored.len(), "loaded status snapshot");

        let mut store = Self::new();
        store.snapshot = Some(path);
        store.records.get_mut().restored = restored
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect();
        Ok(store)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Creates or updates the desired state of `key`.
    ///
    /// The generation is bumped only when `spec` differs from the stored one,
    /// and only then is [`StoreEvent::Applied`] emitted. The status is kept.
    pub async fn apply(&self, key: RecordKey, spec: WatchedRepository) -> Generation {
        let mut records = self.records.write().await;

        if let Some(existing) = records.live.get_mut(&key) {
            if existing.spec == spec {
                return existing.generation;
            }
            existing.spec = spec;
            existing.generation = existing.generation.next();
            let generation = existing.generation;
            drop(records);
            debug!(%key, %generation, "spec updated");
            self.announce(StoreEvent::Applied { key, generation });
            return generation;
        }

        let record = match records.restored.remove(&key) {
            Some(mut restored) => {
                if restored.spec != spec {
                    restored.spec = spec;
                    restored.generation = restored.generation.next();
                }
                restored
            }
            None => PolledRepository::new(key.clone(), spec),
        };
        let generation = record.generation;
        records.live.insert(key.clone(), record);
        drop(records);

        debug!(%key, %generation, "record created");
        self.announce(StoreEvent::Applied { key, generation });
        generation
    }

    /// Deletes `key`. Returns `false` when it did not exist.
    pub async fn remove(&self, key: &RecordKey) -> bool {
        let removed = self.records.write().await.live.remove(key).is_some();
        if removed {
            debug!(%key, "record deleted");
            self.announce(StoreEvent::Deleted { key: key.clone() });
            self.persist_logged().await;
        }
        removed
    }

    /// Deletes every record whose key is not in `keep`, returning the removed keys.
    ///
    /// Restored snapshot entries outside `keep` are dropped as well.
    pub async fn retain(&self, keep: &HashSet<RecordKey>) -> Vec<RecordKey> {
        let removed: Vec<RecordKey> = {
            let mut records = self.records.write().await;
            records.restored.retain(|key, _| keep.contains(key));
            let gone: Vec<RecordKey> = records.live.keys().filter(|k| !keep.contains(*k)).cloned().collect();
            for key in &gone {
                records.live.remove(key);
            }
            gone
        };
        for key in &removed {
            debug!(%key, "record deleted");
            self.announce(StoreEvent::Deleted { key: key.clone() });
        }
        if !removed.is_empty() {
            self.persist_logged().await;
        }
        removed
    }

    pub async fn keys(&self) -> Vec<RecordKey> {
        self.records.read().await.live.keys().cloned().collect()
    }

    fn announce(&self, event: StoreEvent) {
        // No receivers is fine; the scheduler may not be running.
        let _ = self.events.send(event);
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let _guard = self.snapshot_lock.lock().await;
        let records: Vec<PolledRepository> = {
            let records = self.records.read().await;
            // Restored records not yet re-applied are carried over untouched.
            records.live.values().chain(records.restored.values()).cloned().collect()
        };
        write_snapshot(path, &records).await
    }

    async fn persist_logged(&self) {
        if let Err(err) = self.persist().await {
            warn!(error = %err, "failed to write status snapshot");
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<PolledRepository>, StoreError> {
        Ok(self.records.read().await.live.get(key).cloned())
    }

    /// The snapshot is written first; memory only changes once it has landed.
    async fn update_status(&self, key: &RecordKey, status: RepositoryStatus) -> Result<(), StoreError> {
        let _guard = self.snapshot_lock.lock().await;

        if let Some(path) = &self.snapshot {
            let pending: Vec<PolledRepository> = {
                let records = self.records.read().await;
                if !records.live.contains_key(key) {
                    return Err(StoreError::NotFound(key.clone()));
                }
                records
                    .live
                    .values()
                    .chain(records.restored.values())
                    .map(|record| {
                        let mut record = record.clone();
                        if record.key == *key {
                            record.status = status.clone();
                        }
                        record
                    })
                    .collect()
            };
            write_snapshot(path, &pending).await?;
        }

        let mut records = self.records.write().await;
        let record = records
            .live
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        record.status = status;
        Ok(())
    }
}

/// Reads the records saved by a previous run. A missing file is empty.
pub async fn load_snapshot(path: &Path) -> Result<Vec<PolledRepository>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(StoreError::Persistence(format!("reading {}: {err}", path.display())));
        }
    };
    serde_json::from_slice(&bytes)
        .map_err(|err| StoreError::Persistence(format!("decoding {}: {err}", path.display())))
}

/// Writes to a sibling temp file, then renames over `path`.
async fn write_snapshot(path: &Path, records: &[PolledRepository]) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(records)
        .map_err(|err| StoreError::Persistence(format!("encoding snapshot: {err}")))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|err| StoreError::Persistence(format!("writing {}: {err}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|err| StoreError::Persistence(format!("renaming to {}: {err}", path.display())))
}
