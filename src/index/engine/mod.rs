#[cfg(test)]
mod tests;

use std::future::Future;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::database::sqlite::{
    Database, IndexFileQueries, IndexFileRecord, NewVectorIndexEntry, SegmentQueries,
    VectorIndexEntryQueries, VectorType, is_lock_contention,
};
use crate::index::storage::{self, IndexStorageError};
use crate::index::{DistanceMetric, FlatIndex, Neighbor};
use crate::{Result, VectorError};

const RETRY_BACKOFF_MS: u64 = 50;

/// Identifies one physical index: a group and the vector type it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey {
    pub group_id: i64,
    pub index_type: VectorType,
}

impl IndexKey {
    #[inline]
    pub fn new(group_id: i64, index_type: VectorType) -> Self {
        Self {
            group_id,
            index_type,
        }
    }
}

impl std::fmt::Display for IndexKey {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group {} ({})", self.group_id, self.index_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { position: usize },
    /// An entry for the entity already exists; nothing was written
    AlreadyPresent,
}

/// How a caller intends to use a loaded working copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    /// Search only. Nothing in the metadata store is touched.
    Read,
    /// Appends and swaps. Crash leftovers are reconciled and an unusable
    /// artifact is retired.
    Write,
}

/// Cached working copy of one key plus the writes not yet persisted
#[derive(Debug, Default)]
struct IndexSlot {
    index: Option<FlatIndex>,
    file_name: Option<String>,
    /// Whether the mapping was checked against the loaded artifact
    reconciled: bool,
    dirty: bool,
    /// Entities appended since the last persist, flagged on flush
    pending: Vec<i64>,
}

#[derive(Debug, Default)]
struct SlotHandle {
    lock: RwLock<IndexSlot>,
    /// Engine tick of the last access
    last_used: AtomicU64,
}

/// Owns the working copies of every `(group, type)` index and mediates all
/// reads and writes of their artifacts.
///
/// Each key has its own `RwLock`: appends, flushes and generation swaps hold
/// the write half, searches the read half. Keys never contend with each
/// other. At most `max_cached_indexes` working copies stay cached; the least
/// recently used clean ones are dropped first.
#[derive(Debug)]
pub struct IndexEngine {
    database: Database,
    index_dir: PathBuf,
    dimension: usize,
    metric: DistanceMetric,
    max_write_retries: u32,
    max_cached: usize,
    clock: AtomicU64,
    slots: DashMap<IndexKey, Arc<SlotHandle>>,
}

impl IndexEngine {
    #[inline]
    pub fn new(database: Database, config: &Config) -> Self {
        Self {
            database,
            index_dir: config.index_dir_path(),
            dimension: config.embedding_dimension(),
            metric: config.index.metric,
            max_write_retries: config.index.max_write_retries.max(1),
            max_cached: config.index.max_cached_indexes.max(1),
            clock: AtomicU64::new(0),
            slots: DashMap::new(),
        }
    }

    #[inline]
    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    #[inline]
    pub fn database(&self) -> &Database {
        &self.database
    }

    fn pool(&self) -> &SqlitePool {
        self.database.pool()
    }

    fn slot(&self, key: IndexKey) -> Arc<SlotHandle> {
        let handle = Arc::clone(self.slots.entry(key).or_default().value());
        handle
            .last_used
            .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        self.trim_cache();
        handle
    }

    /// Number of working copies currently cached
    #[inline]
    pub fn cached_keys(&self) -> usize {
        self.slots.len()
    }

    /// Drops least recently used slots until the cache fits its bound.
    /// Slots that are dirty, locked or held by a caller stay.
    fn trim_cache(&self) {
        let excess = self.slots.len().saturating_sub(self.max_cached);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(u64, IndexKey)> = self
            .slots
            .iter()
            .map(|entry| (entry.value().last_used.load(Ordering::Relaxed), *entry.key()))
            .collect();
        by_age.sort_unstable();

        let mut dropped = 0;
        for (_, key) in by_age {
            if dropped == excess {
                break;
            }
            let removed = self.slots.remove_if(&key, |_, handle| {
                Arc::strong_count(handle) == 1
                    && handle.lock.try_read().is_ok_and(|slot| !slot.dirty)
            });
            if removed.is_some() {
                debug!("Dropped cached working copy of {}", key);
                dropped += 1;
            }
        }
    }

    fn empty_index(&self) -> FlatIndex {
        FlatIndex::new(self.dimension, self.metric)
    }

    /// Whether the registry holds a valid artifact for the key
    #[inline]
    pub async fn has_valid_index(&self, key: IndexKey) -> Result<bool> {
        let file = IndexFileQueries::get_valid(self.pool(), key.group_id, key.index_type).await?;
        Ok(file.is_some())
    }

    /// Reads the artifact named by the valid registry row. A key with no row
    /// yields an empty index of the configured dimension.
    #[inline]
    pub async fn load(&self, key: IndexKey) -> Result<FlatIndex> {
        match IndexFileQueries::get_valid(self.pool(), key.group_id, key.index_type).await? {
            Some(file) => self.read_artifact(key, &file.file_path).await,
            None => Ok(self.empty_index()),
        }
    }

    async fn read_artifact(&self, key: IndexKey, file_name: &str) -> Result<FlatIndex> {
        let path = self.index_dir.join(file_name);
        let index = match storage::read(&path).await {
            Ok(index) => index,
            Err(IndexStorageError::NotFound(path)) => {
                return Err(VectorError::IndexMissing {
                    group_id: key.group_id,
                    index_type: key.index_type,
                    path: path.display().to_string(),
                });
            }
            Err(e) => return Err(invalid(key, e.to_string())),
        };

        if index.dimension() != self.dimension {
            return Err(invalid(
                key,
                format!(
                    "artifact dimension {} does not match configured {}",
                    index.dimension(),
                    self.dimension
                ),
            ));
        }

        if index.metric() != self.metric {
            return Err(invalid(
                key,
                format!(
                    "artifact metric {} does not match configured {}",
                    index.metric(),
                    self.metric
                ),
            ));
        }

        Ok(index)
    }

    /// Loads the key into its slot if it is not cached yet.
    ///
    /// In [`LoadMode::Write`] the mapping is also reconciled with the
    /// artifact, once per cached copy, and an invalid or missing artifact is
    /// retired: the registry row is invalidated, the key's entries are
    /// dropped, their sources are reset and the slot starts from an empty
    /// index. [`LoadMode::Read`] reports such artifacts as errors and never
    /// writes.
    async fn ensure_loaded<'a>(
        &self,
        key: IndexKey,
        slot: &'a mut IndexSlot,
        mode: LoadMode,
    ) -> Result<&'a mut FlatIndex> {
        if slot.index.is_none() {
            let registry =
                IndexFileQueries::get_valid(self.pool(), key.group_id, key.index_type).await?;

            let loaded = match &registry {
                Some(file) => self.read_artifact(key, &file.file_path).await,
                None => Ok(self.empty_index()),
            };

            let (index, file_name) = match loaded {
                Ok(index) => (index, registry.as_ref().map(|f| f.file_path.clone())),
                Err(
                    e @ (VectorError::IndexInvalid { .. } | VectorError::IndexMissing { .. }),
                ) if mode == LoadMode::Write => {
                    warn!("{}; starting {} from an empty index", e, key);
                    self.discard_key(key).await?;
                    (self.empty_index(), None)
                }
                Err(e) => return Err(e),
            };

            *slot = IndexSlot {
                index: Some(index),
                file_name,
                ..IndexSlot::default()
            };
        }

        if mode == LoadMode::Write && !slot.reconciled {
            let registry_count =
                IndexFileQueries::get_valid(self.pool(), key.group_id, key.index_type)
                    .await?
                    .map(|f| f.vector_count);
            let index = slot
                .index
                .as_mut()
                .ok_or_else(|| VectorError::Other(anyhow::anyhow!("{key} failed to load")))?;
            let repaired = self.reconcile(key, index, registry_count).await?;
            slot.dirty |= repaired;
            slot.reconciled = true;
        }

        slot.index
            .as_mut()
            .ok_or_else(|| VectorError::Other(anyhow::anyhow!("{key} failed to load")))
    }

    /// Repairs the mapping after a crash between an entry insert and the
    /// persist that should have followed. Returns whether the working copy
    /// now differs from what the registry describes. The registry's
    /// `vector_count` always records the artifact length.
    async fn reconcile(
        &self,
        key: IndexKey,
        index: &mut FlatIndex,
        registry_count: Option<i64>,
    ) -> Result<bool> {
        let len = index.len() as i64;
        let pool = self.pool();

        let dangling = self
            .with_write_retry(key, "reconcile", || drop_entries_from(pool, key, len))
            .await?;
        if !dangling.is_empty() {
            warn!(
                "{}: dropped {} entries beyond the {} persisted vectors",
                key,
                dangling.len(),
                len
            );
        }

        let referenced = VectorIndexEntryQueries::max_position(pool, key.group_id, key.index_type)
            .await?
            .map_or(0, |max| max + 1) as usize;

        let mut repaired = false;
        if referenced < index.len() {
            warn!(
                "{}: truncating {} unreferenced vectors",
                key,
                index.len() - referenced
            );
            index.truncate(referenced);
            repaired = true;
        }

        if let Some(registry_count) = registry_count {
            repaired |= registry_count != index.len() as i64;
        }

        Ok(repaired)
    }

    async fn discard_key(&self, key: IndexKey) -> Result<()> {
        let pool = self.pool();
        let dropped = self
            .with_write_retry(key, "discard", || retire_key(pool, key))
            .await?;
        warn!(
            "{}: invalidated artifact and dropped {} entries",
            key, dropped
        );
        Ok(())
    }

    /// Appends one vector for `entity_id` and records its position.
    ///
    /// The entry row is written before the in-memory append, so a failed
    /// insert leaves the working copy untouched. The source flag is set by
    /// the next persist of the key.
    #[inline]
    pub async fn append_entry(
        &self,
        key: IndexKey,
        entity_id: i64,
        vector: &[f32],
        summary: &str,
    ) -> Result<AppendOutcome> {
        let slot = self.slot(key);
        let mut guard = slot.lock.write().await;

        // Loading first lets reconciliation drop entries a crash left behind
        let index = self.ensure_loaded(key, &mut guard, LoadMode::Write).await?;

        if VectorIndexEntryQueries::exists(self.pool(), key.group_id, key.index_type, entity_id)
            .await?
        {
            debug!("{}: entity {} already indexed", key, entity_id);
            return Ok(AppendOutcome::AlreadyPresent);
        }

        if vector.len() != index.dimension() {
            return Err(VectorError::DimensionMismatch {
                expected: index.dimension(),
                got: vector.len(),
            });
        }

        let entry = NewVectorIndexEntry {
            group_id: key.group_id,
            vector_type: key.index_type,
            entity_id,
            faiss_index: index.len() as i64,
            content_summary: summary.to_string(),
        };

        let pool = self.pool();
        self.with_write_retry(key, "insert entry", || insert_entry(pool, &entry))
            .await?;

        let position = index.append(vector)?;
        guard.dirty = true;
        guard.pending.push(entity_id);

        debug!("{}: entity {} at position {}", key, entity_id, position);
        Ok(AppendOutcome::Appended { position })
    }

    /// Persists the key if it has unpersisted writes. Idempotent.
    #[inline]
    pub async fn flush_key(&self, key: IndexKey) -> Result<bool> {
        let Some(slot) = self.slots.get(&key).map(|entry| Arc::clone(entry.value())) else {
            return Ok(false);
        };
        let mut guard = slot.lock.write().await;
        self.persist_slot(key, &mut guard).await
    }

    /// Persists every dirty key. Failures are logged and the first is
    /// returned after all keys were attempted.
    #[inline]
    pub async fn flush_all(&self) -> Result<usize> {
        let keys: Vec<IndexKey> = self.slots.iter().map(|entry| *entry.key()).collect();
        let mut flushed = 0;
        let mut first_error = None;

        for key in keys {
            match self.flush_key(key).await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to flush {}: {}", key, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.trim_cache();

        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    async fn persist_slot(&self, key: IndexKey, slot: &mut IndexSlot) -> Result<bool> {
        if !slot.dirty {
            return Ok(false);
        }
        let Some(index) = slot.index.as_ref() else {
            return Ok(false);
        };

        let file_name = slot
            .file_name
            .clone()
            .unwrap_or_else(|| storage::file_name(key.group_id, key.index_type));
        let path = self.index_dir.join(&file_name);

        let file_size = storage::write_atomic(&path, index)
            .await
            .map_err(|e| storage_failure(key, e))?;

        let record = IndexFileRecord {
            group_id: key.group_id,
            index_type: key.index_type,
            file_path: file_name.clone(),
            dimension: index.dimension() as i64,
            vector_count: index.len() as i64,
            file_size: file_size as i64,
        };
        let vectors = index.len();
        let pending = slot.pending.as_slice();
        let pool = self.pool();

        let entries = self
            .with_write_retry(key, "flush", || commit_flush(pool, &record, pending))
            .await?;

        // Orphan cleanup compacts the artifact, so a gap means the mapping
        // lost rows outside the engine

        if entries != vectors as i64 {
            warn!(
                "{}: {} entries reference an artifact of {} vectors",
                key, entries, vectors
            );
        }

        info!(
            "Persisted {} ({} vectors, {} bytes, {} newly flagged)",
            key,
            vectors,
            file_size,
            slot.pending.len()
        );

        slot.file_name = Some(file_name);
        slot.dirty = false;
        slot.pending.clear();
        Ok(true)
    }

    /// Exact k-NN over the key's working copy.
    ///
    /// A key whose artifact cannot be loaded reports the load error. The
    /// read path never repairs: reconciliation and artifact retirement wait
    /// for the next write to the key. Entries past the artifact length are
    /// unreachable from here, so an unreconciled copy is safe to search.
    #[inline]
    pub async fn search(&self, key: IndexKey, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let slot = self.slot(key);

        {
            let guard = slot.lock.read().await;
            if let Some(index) = guard.index.as_ref() {
                return index.search(query, k);
            }
        }

        let mut guard = slot.lock.write().await;
        self.ensure_loaded(key, &mut guard, LoadMode::Read).await?;
        let guard = guard.downgrade();
        match guard.index.as_ref() {
            Some(index) => index.search(query, k),
            None => Ok(Vec::new()),
        }
    }

    /// Number of vectors in the cached working copy, if loaded
    #[inline]
    pub async fn working_len(&self, key: IndexKey) -> Option<usize> {
        let slot = self.slots.get(&key).map(|entry| Arc::clone(entry.value()))?;
        let guard = slot.lock.read().await;
        guard.index.as_ref().map(FlatIndex::len)
    }

    /// Flushes and forgets the cached working copy of a key
    #[inline]
    pub async fn evict(&self, key: IndexKey) -> Result<()> {
        let Some(slot) = self.slots.get(&key).map(|entry| Arc::clone(entry.value())) else {
            return Ok(());
        };
        let mut guard = slot.lock.write().await;
        self.persist_slot(key, &mut guard).await?;
        *guard = IndexSlot::default();
        Ok(())
    }

    /// Writes a rebuilt generation to a fresh file, then swaps the mapping
    /// and the registry in one transaction. The cached copy is replaced
    /// only after the commit.
    #[inline]
    pub async fn install_generation(
        &self,
        key: IndexKey,
        index: FlatIndex,
        entries: Vec<NewVectorIndexEntry>,
    ) -> Result<()> {
        let slot = self.slot(key);
        let mut guard = slot.lock.write().await;
        self.replace_generation(key, &mut guard, index, &entries)
            .await
    }

    /// Removes the key's entries whose source entity no longer exists and
    /// compacts the artifact so the survivors keep dense positions. The
    /// result is installed as a new generation. Returns the number of
    /// entries removed.
    #[inline]
    pub async fn purge_orphans(&self, key: IndexKey) -> Result<u64> {
        let slot = self.slot(key);
        let mut guard = slot.lock.write().await;
        self.ensure_loaded(key, &mut guard, LoadMode::Write).await?;

        let pool = self.pool();
        let orphans: HashSet<i64> =
            VectorIndexEntryQueries::list_orphans(pool, key.group_id, key.index_type)
                .await?
                .into_iter()
                .collect();
        if orphans.is_empty() {
            return Ok(0);
        }

        let entries = VectorIndexEntryQueries::list_for_key(pool, key.group_id, key.index_type)
            .await?;
        let current = guard
            .index
            .as_ref()
            .ok_or_else(|| VectorError::Other(anyhow::anyhow!("{key} failed to load")))?;

        let mut compacted = self.empty_index();
        let mut survivors = Vec::with_capacity(entries.len().saturating_sub(orphans.len()));
        for entry in entries {
            if orphans.contains(&entry.entity_id) {
                continue;
            }
            let vector = usize::try_from(entry.faiss_index)
                .ok()
                .and_then(|position| current.vector(position))
                .ok_or_else(|| {
                    invalid(
                        key,
                        format!(
                            "entity {} maps to position {} past {} vectors",
                            entry.entity_id,
                            entry.faiss_index,
                            current.len()
                        ),
                    )
                })?;
            let position = compacted.append(vector)?;
            survivors.push(NewVectorIndexEntry {
                group_id: key.group_id,
                vector_type: key.index_type,
                entity_id: entry.entity_id,
                faiss_index: position as i64,
                content_summary: entry.content_summary,
            });
        }

        info!(
            "{}: compacting away {} orphaned entries, {} remain",
            key,
            orphans.len(),
            survivors.len()
        );
        self.replace_generation(key, &mut guard, compacted, &survivors)
            .await?;
        Ok(orphans.len() as u64)
    }

    async fn replace_generation(
        &self,
        key: IndexKey,
        slot: &mut IndexSlot,
        index: FlatIndex,
        entries: &[NewVectorIndexEntry],
    ) -> Result<()> {
        if index.dimension() != self.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimension,
                got: index.dimension(),
            });
        }

        let file_name = storage::generation_file_name(key.group_id, key.index_type);
        let path = self.index_dir.join(&file_name);
        let file_size = storage::write_atomic(&path, &index)
            .await
            .map_err(|e| storage_failure(key, e))?;

        let record = IndexFileRecord {
            group_id: key.group_id,
            index_type: key.index_type,
            file_path: file_name.clone(),
            dimension: index.dimension() as i64,
            vector_count: index.len() as i64,
            file_size: file_size as i64,
        };
        let pool = self.pool();

        let swapped = self
            .with_write_retry(key, "swap generation", || {
                swap_generation(pool, &record, entries)
            })
            .await;

        if let Err(e) = swapped {
            error!("{}: generation swap failed, removing {}", key, path.display());
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        info!(
            "Installed new generation for {} at {} ({} vectors)",
            key,
            file_name,
            index.len()
        );

        *slot = IndexSlot {
            index: Some(index),
            file_name: Some(file_name),
            reconciled: true,
            dirty: false,
            pending: Vec::new(),
        };
        Ok(())
    }

    /// Runs a database write, retrying SQLite lock contention with
    /// exponential backoff.
    async fn with_write_retry<T, F, Fut>(
        &self,
        key: IndexKey,
        operation: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_lock_contention(&e) => {
                    if attempt >= self.max_write_retries {
                        error!(
                            "{}: {} still contended after {} attempts",
                            key, operation, attempt
                        );
                        return Err(VectorError::ConcurrencyConflict {
                            group_id: key.group_id,
                            index_type: key.index_type,
                            attempts: attempt,
                        });
                    }
                    let delay = Duration::from_millis(RETRY_BACKOFF_MS * 2u64.pow(attempt - 1));
                    warn!(
                        "{}: {} hit lock contention, retrying in {:?} ({}/{})",
                        key, operation, delay, attempt, self.max_write_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("{}: {} failed: {:#}", key, operation, e);
                    return Err(VectorError::Database(format!("{e:#}")));
                }
            }
        }
    }
}

fn invalid(key: IndexKey, reason: String) -> VectorError {
    VectorError::IndexInvalid {
        group_id: key.group_id,
        index_type: key.index_type,
        reason,
    }
}

fn storage_failure(key: IndexKey, error: IndexStorageError) -> VectorError {
    match error {
        IndexStorageError::Io(e) => {
            error!("{}: failed to write artifact: {}", key, e);
            VectorError::Io(e)
        }
        other => invalid(key, other.to_string()),
    }
}

/// Sets or clears the vectorized flag of source entities. Only segments
/// carry the flag.
async fn set_source_flags(
    conn: &mut SqliteConnection,
    vector_type: VectorType,
    entity_ids: &[i64],
    vectorized: bool,
) -> anyhow::Result<()> {
    match vector_type {
        VectorType::ConversationSegment => {
            SegmentQueries::set_vectorized(conn, entity_ids, vectorized).await?;
        }
        VectorType::Message => {}
    }
    Ok(())
}

async fn insert_entry(pool: &SqlitePool, entry: &NewVectorIndexEntry) -> anyhow::Result<i64> {
    let mut conn = pool
        .acquire()
        .await
        .context("Failed to acquire connection")?;
    VectorIndexEntryQueries::insert(&mut conn, entry).await
}

async fn drop_entries_from(
    pool: &SqlitePool,
    key: IndexKey,
    position: i64,
) -> anyhow::Result<Vec<i64>> {
    let mut transaction = pool
        .begin()
        .await
        .context("Failed to begin reconcile transaction")?;
    let dropped = VectorIndexEntryQueries::delete_from_position(
        &mut transaction,
        key.group_id,
        key.index_type,
        position,
    )
    .await?;
    set_source_flags(&mut transaction, key.index_type, &dropped, false).await?;
    transaction
        .commit()
        .await
        .context("Failed to commit reconcile transaction")?;
    Ok(dropped)
}

async fn retire_key(pool: &SqlitePool, key: IndexKey) -> anyhow::Result<usize> {
    let mut transaction = pool
        .begin()
        .await
        .context("Failed to begin discard transaction")?;
    IndexFileQueries::invalidate(&mut transaction, key.group_id, key.index_type).await?;
    let dropped =
        VectorIndexEntryQueries::delete_for_key(&mut transaction, key.group_id, key.index_type)
            .await?;
    set_source_flags(&mut transaction, key.index_type, &dropped, false).await?;
    transaction
        .commit()
        .await
        .context("Failed to commit discard transaction")?;
    Ok(dropped.len())
}

/// Registry upsert and source flags for a persisted artifact. Returns the
/// key's entry count so the caller can compare it with the artifact length.
async fn commit_flush(
    pool: &SqlitePool,
    record: &IndexFileRecord,
    pending: &[i64],
) -> anyhow::Result<i64> {
    let mut transaction = pool
        .begin()
        .await
        .context("Failed to begin flush transaction")?;

    let entries =
        VectorIndexEntryQueries::count_for_key(&mut transaction, record.group_id, record.index_type)
            .await?;
    IndexFileQueries::upsert_valid(&mut transaction, record).await?;
    set_source_flags(&mut transaction, record.index_type, pending, true).await?;

    transaction
        .commit()
        .await
        .context("Failed to commit flush transaction")?;
    Ok(entries)
}

async fn swap_generation(
    pool: &SqlitePool,
    record: &IndexFileRecord,
    entries: &[NewVectorIndexEntry],
) -> anyhow::Result<()> {
    let mut transaction = pool
        .begin()
        .await
        .context("Failed to begin generation swap transaction")?;

    let previous =
        VectorIndexEntryQueries::delete_for_key(&mut transaction, record.group_id, record.index_type)
            .await?;
    set_source_flags(&mut transaction, record.index_type, &previous, false).await?;

    for entry in entries {
        VectorIndexEntryQueries::insert(&mut transaction, entry).await?;
    }

    IndexFileQueries::invalidate(&mut transaction, record.group_id, record.index_type).await?;
    IndexFileQueries::insert_valid(&mut transaction, record).await?;

    let rebuilt: Vec<i64> = entries.iter().map(|entry| entry.entity_id).collect();
    set_source_flags(&mut transaction, record.index_type, &rebuilt, true).await?;

    transaction
        .commit()
        .await
        .context("Failed to commit generation swap transaction")?;
    Ok(())
}
