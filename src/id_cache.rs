//! Hash-partitioned map from external identifiers to internal row ids.
//!
//! Each partition owns one mutex, one in-memory map and (once the first drain
//! reaches it) one backing cache table with its own connection. Partitions are
//! fully independent, so lookups and puts on different partitions never
//! contend. Entries drained to a table stay retrievable under the same key for
//! the rest of the run.

use crate::cache_table::{CacheTable, CacheTableModel, CacheTableStore};
use crate::config::PipelineConfig;
use crate::db::{execute_in_batches, DatabaseAdapter};
use crate::error::PipelineError;
use crate::models::{CacheEntry, TypeTag};
use rusqlite::{params, OptionalExtension};
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub partitions: usize,
    pub drain_threshold: usize,
    pub drain_batch: usize,
    pub max_rows_per_table: usize,
    pub batch_size: usize,
}

impl CacheSettings {
    /// Write batches follow the adapter's limit; everything else comes from
    /// the run configuration.
    pub fn from_config(config: &PipelineConfig, adapter: &dyn DatabaseAdapter) -> Self {
        Self {
            partitions: config.partitions.max(1),
            drain_threshold: config.drain_threshold,
            drain_batch: config.drain_batch,
            max_rows_per_table: config.max_rows_per_table.max(1),
            batch_size: adapter.max_batch_size(),
        }
    }
}

struct Slot {
    entry: CacheEntry,
    requested: bool,
}

struct Partition {
    index: usize,
    entries: FxHashMap<String, Slot>,
    /// Reverse index over `entries`.
    by_internal: FxHashMap<(i64, TypeTag), String>,
    /// Ids looked up before anyone produced them.
    pending: FxHashSet<String>,
    table: Option<CacheTable>,
    rows_in_latest: usize,
}

pub struct IdCache {
    store: Arc<CacheTableStore>,
    partitions: Vec<Mutex<Partition>>,
    settings: CacheSettings,
    in_memory: AtomicUsize,
    drained: AtomicU64,
    drain_lock: Mutex<()>,
}

impl IdCache {
    pub fn new(store: Arc<CacheTableStore>, settings: CacheSettings) -> Self {
        let partitions = (0..settings.partitions.max(1))
            .map(|index| {
                Mutex::new(Partition {
                    index,
                    entries: FxHashMap::default(),
                    by_internal: FxHashMap::default(),
                    pending: FxHashSet::default(),
                    table: None,
                    rows_in_latest: 0,
                })
            })
            .collect();
        Self {
            store,
            partitions,
            settings,
            in_memory: AtomicUsize::new(0),
            drained: AtomicU64::new(0),
            drain_lock: Mutex::new(()),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition_of(&self, external_id: &str) -> usize {
        let mut hasher = FxHasher::default();
        external_id.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    pub fn in_memory_len(&self) -> usize {
        self.in_memory.load(Ordering::Relaxed)
    }

    /// Total entries persisted to cache tables so far.
    pub fn drained(&self) -> u64 {
        self.drained.load(Ordering::Relaxed)
    }

    fn lock(&self, index: usize) -> MutexGuard<'_, Partition> {
        self.partitions[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up an entry, first in memory and then in the partition's tables.
    ///
    /// A miss records the id as requested, so the entry is persisted first
    /// once it is eventually produced and drained.
    pub fn lookup(&self, external_id: &str) -> Result<Option<CacheEntry>, PipelineError> {
        self.lookup_with(external_id, true)
    }

    /// Like [`IdCache::lookup`] but leaves no trace: hits are not marked
    /// requested and misses are not remembered. Used once every id that
    /// will ever be produced has been put.
    pub fn find(&self, external_id: &str) -> Result<Option<CacheEntry>, PipelineError> {
        self.lookup_with(external_id, false)
    }

    fn lookup_with(&self, external_id: &str, mark: bool) -> Result<Option<CacheEntry>, PipelineError> {
        let mut partition = self.lock(self.partition_of(external_id));
        if let Some(slot) = partition.entries.get_mut(external_id) {
            slot.requested |= mark;
            return Ok(Some(slot.entry.clone()));
        }
        if let Some(entry) = partition.find_persisted(external_id)? {
            return Ok(Some(entry));
        }
        if mark {
            partition.pending.insert(external_id.to_string());
        }
        Ok(None)
    }

    /// Ids looked up but never produced, across all partitions.
    pub fn pending_len(&self) -> usize {
        (0..self.partitions.len())
            .map(|index| self.lock(index).pending.len())
            .sum()
    }

    /// Forgets every outstanding request. Called when no further puts can
    /// satisfy them.
    pub fn clear_pending(&self) -> usize {
        let mut cleared = 0;
        for index in 0..self.partitions.len() {
            let mut partition = self.lock(index);
            cleared += partition.pending.len();
            partition.pending = FxHashSet::default();
        }
        cleared
    }

    /// Reverse lookup from internal id to external id.
    ///
    /// The internal id says nothing about which partition stored the entry, so
    /// this probes every partition in turn: O(P) partition locks, each with
    /// one hash probe and indexed table queries.
    pub fn lookup_by_internal_id(
        &self,
        internal_id: i64,
        type_tag: TypeTag,
    ) -> Result<Option<String>, PipelineError> {
        for index in 0..self.partitions.len() {
            let partition = self.lock(index);
            if let Some(external_id) = partition.by_internal.get(&(internal_id, type_tag)) {
                return Ok(Some(external_id.clone()));
            }
            if let Some(external_id) = partition.find_persisted_by_internal_id(internal_id, type_tag)? {
                return Ok(Some(external_id));
            }
        }
        Ok(None)
    }

    /// Stores the authoritative entry for an external id.
    ///
    /// Returns `false` without changing anything when an entry for the id
    /// already exists, in memory or in a cache table.
    pub fn put(&self, entry: CacheEntry) -> Result<bool, PipelineError> {
        let total = {
            let mut partition = self.lock(self.partition_of(&entry.external_id));
            if partition.entries.contains_key(&entry.external_id)
                || partition.find_persisted(&entry.external_id)?.is_some()
            {
                return Ok(false);
            }
            let requested = partition.pending.remove(&entry.external_id);
            partition.insert(entry, requested);
            // Counted under the partition lock, so a drain of this entry
            // always sees the increment first.
            self.in_memory.fetch_add(1, Ordering::Relaxed) + 1
        };
        if total > self.settings.drain_threshold {
            self.auto_drain()?;
        }
        Ok(true)
    }

    /// Removes the entry for an external id, in memory or persisted.
    ///
    /// Returns `false` when the id was unknown.
    pub fn remove(&self, external_id: &str) -> Result<bool, PipelineError> {
        let mut partition = self.lock(self.partition_of(external_id));
        if let Some(slot) = partition.entries.remove(external_id) {
            partition
                .by_internal
                .remove(&(slot.entry.internal_id, slot.entry.type_tag));
            self.in_memory.fetch_sub(1, Ordering::Relaxed);
            return Ok(true);
        }
        partition.delete_persisted(external_id)
    }

    fn auto_drain(&self) -> Result<(), PipelineError> {
        // Another thread is already draining; let it catch up.
        let Ok(_guard) = self.drain_lock.try_lock() else {
            return Ok(());
        };
        let drained = self.drain_locked(self.settings.drain_batch)?;
        info!(
            drained,
            in_memory = self.in_memory_len(),
            "Identifier cache drained to cache tables"
        );
        Ok(())
    }

    /// Persists entries to the partitions' cache tables.
    ///
    /// Requested entries always go first and are always persisted; the rest
    /// fill up to `max_count` entries in total, spread across partitions.
    pub fn drain(&self, max_count: usize) -> Result<usize, PipelineError> {
        let _guard = self.drain_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.drain_locked(max_count)
    }

    fn drain_locked(&self, max_count: usize) -> Result<usize, PipelineError> {
        let fair_share = max_count.div_ceil(self.partitions.len());
        let mut budget = max_count;
        let mut total = 0;
        // First pass spreads the budget evenly (and flushes every requested
        // entry); the second hands leftover budget to partitions that still
        // hold entries.
        for pass in 0..2 {
            for index in 0..self.partitions.len() {
                if pass == 1 && budget == 0 {
                    break;
                }
                let quota = if pass == 0 { fair_share.min(budget) } else { budget };
                let mut partition = self.lock(index);
                let written = partition.drain(quota, &self.store, &self.settings)?;
                drop(partition);

                budget = budget.saturating_sub(written);
                total += written;
                self.in_memory.fetch_sub(written, Ordering::Relaxed);
            }
        }
        self.drained.fetch_add(total as u64, Ordering::Relaxed);
        Ok(total)
    }

    /// Drops every partition's cache table. Safe to call repeatedly.
    pub fn drop_tables(&self) -> Result<(), PipelineError> {
        for index in 0..self.partitions.len() {
            if let Some(table) = self.lock(index).table.as_mut() {
                table.drop_table()?;
            }
        }
        Ok(())
    }
}

impl Partition {
    fn insert(&mut self, entry: CacheEntry, requested: bool) {
        self.by_internal.insert(
            (entry.internal_id, entry.type_tag),
            entry.external_id.clone(),
        );
        self.entries
            .insert(entry.external_id.clone(), Slot { entry, requested });
    }

    fn delete_persisted(&self, external_id: &str) -> Result<bool, PipelineError> {
        let Some(table) = &self.table else {
            return Ok(false);
        };
        let mut deleted = 0;
        for (name, conn) in table.tables() {
            deleted += conn
                .prepare_cached(&format!("DELETE FROM \"{name}\" WHERE external_id = ?1"))
                .and_then(|mut stmt| stmt.execute(params![external_id]))
                .map_err(|e| PipelineError::database(format!("remove {external_id} from {name}"), e))?;
        }
        Ok(deleted > 0)
    }

    fn find_persisted(&self, external_id: &str) -> Result<Option<CacheEntry>, PipelineError> {
        let Some(table) = &self.table else {
            return Ok(None);
        };
        for (name, conn) in table.tables() {
            let row = conn
                .prepare_cached(&format!(
                    "SELECT internal_id, root_id, reverse, mapping, type_tag \
                     FROM \"{name}\" WHERE external_id = ?1 LIMIT 1"
                ))
                .and_then(|mut stmt| {
                    stmt.query_row(params![external_id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, bool>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    })
                    .optional()
                })
                .map_err(|e| PipelineError::database(format!("lookup {external_id} in {name}"), e))?;

            if let Some((internal_id, root_id, reverse, mapping, code)) = row {
                let type_tag = TypeTag::from_code(code).ok_or_else(|| {
                    PipelineError::Internal(format!("unknown type code {code} in {name}"))
                })?;
                return Ok(Some(CacheEntry {
                    external_id: external_id.to_string(),
                    internal_id,
                    root_id,
                    reverse,
                    mapping,
                    type_tag,
                }));
            }
        }
        Ok(None)
    }

    fn find_persisted_by_internal_id(
        &self,
        internal_id: i64,
        type_tag: TypeTag,
    ) -> Result<Option<String>, PipelineError> {
        let Some(table) = &self.table else {
            return Ok(None);
        };
        for (name, conn) in table.tables() {
            let found: Option<String> = conn
                .prepare_cached(&format!(
                    "SELECT external_id FROM \"{name}\" \
                     WHERE internal_id = ?1 AND type_tag = ?2 LIMIT 1"
                ))
                .and_then(|mut stmt| {
                    stmt.query_row(params![internal_id, type_tag.code()], |row| row.get(0))
                        .optional()
                })
                .map_err(|e| PipelineError::database(format!("reverse lookup in {name}"), e))?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn drain(
        &mut self,
        quota: usize,
        store: &CacheTableStore,
        settings: &CacheSettings,
    ) -> Result<usize, PipelineError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.requested)
            .map(|(key, _)| key.clone())
            .collect();
        let room = quota.saturating_sub(keys.len());
        keys.extend(
            self.entries
                .iter()
                .filter(|(_, slot)| !slot.requested)
                .take(room)
                .map(|(key, _)| key.clone()),
        );
        if keys.is_empty() {
            return Ok(0);
        }

        if self.table.is_none() {
            self.table = Some(store.create_indexed(CacheTableModel::IdMapping)?);
        }
        let Partition {
            index,
            entries,
            by_internal,
            table,
            rows_in_latest,
            ..
        } = self;
        let Some(table) = table.as_mut() else {
            return Ok(0);
        };
        if *rows_in_latest >= settings.max_rows_per_table {
            table.branch()?;
            *rows_in_latest = 0;
        }

        let batch: Vec<&CacheEntry> = keys
            .iter()
            .filter_map(|key| entries.get(key).map(|slot| &slot.entry))
            .collect();
        let (name, conn) = table.latest();
        let written = execute_in_batches(
            conn,
            &format!(
                "INSERT INTO \"{name}\" \
                 (external_id, internal_id, root_id, reverse, mapping, type_tag) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            &batch,
            settings.batch_size,
            |stmt, entry| {
                stmt.execute(params![
                    entry.external_id,
                    entry.internal_id,
                    entry.root_id,
                    entry.reverse,
                    entry.mapping,
                    entry.type_tag.code(),
                ])
            },
        )?;

        for key in &keys {
            if let Some(slot) = entries.remove(key) {
                by_internal.remove(&(slot.entry.internal_id, slot.entry.type_tag));
            }
        }
        *rows_in_latest += written;
        debug!(partition = *index, written, table = name, "Drained partition");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseAdapter, SqliteAdapter};
    use std::thread;
    use tempfile::TempDir;

    fn settings(partitions: usize) -> CacheSettings {
        CacheSettings {
            partitions,
            drain_threshold: usize::MAX,
            drain_batch: 100,
            max_rows_per_table: 1_000_000,
            batch_size: 50,
        }
    }

    fn cache(dir: &TempDir, settings: CacheSettings) -> IdCache {
        let adapter: Arc<dyn DatabaseAdapter> =
            Arc::new(SqliteAdapter::new(dir.path().join("cache.db")));
        IdCache::new(Arc::new(CacheTableStore::new(adapter, "test")), settings)
    }

    fn entry_for(i: i64) -> CacheEntry {
        let mut entry = CacheEntry::new(format!("gml-{i}"), 1000 + i, TypeTag::Building)
            .with_root(1000 + i / 10);
        entry.reverse = i % 2 == 0;
        entry.mapping = (i % 3 == 0).then(|| format!("map-{i}"));
        entry
    }

    #[test]
    fn put_then_lookup_before_and_after_drain() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, settings(4));
        for i in 0..200 {
            assert!(cache.put(entry_for(i)).unwrap());
        }
        for i in 0..200 {
            assert_eq!(cache.lookup(&format!("gml-{i}")).unwrap(), Some(entry_for(i)));
        }

        let drained = cache.drain(usize::MAX).unwrap();
        assert_eq!(drained, 200);
        assert_eq!(cache.in_memory_len(), 0);
        assert_eq!(cache.drained(), 200);

        for i in 0..200 {
            assert_eq!(cache.lookup(&format!("gml-{i}")).unwrap(), Some(entry_for(i)));
        }
    }

    #[test]
    fn requested_before_produced_survives_drain() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, settings(4));
        for i in 0..40 {
            cache.put(entry_for(i)).unwrap();
        }

        assert_eq!(cache.lookup("gml-42").unwrap(), None);
        let entry = CacheEntry::new("gml-42", 4242, TypeTag::Bridge);
        assert!(cache.put(entry.clone()).unwrap());

        // A drain budget of one still persists every requested entry.
        cache.drain(1).unwrap();
        let partition = cache.lock(cache.partition_of("gml-42"));
        assert!(!partition.entries.contains_key("gml-42"));
        drop(partition);

        assert_eq!(cache.lookup("gml-42").unwrap(), Some(entry));
    }

    #[test]
    fn second_put_is_rejected_even_after_drain() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, settings(2));
        assert!(cache.put(entry_for(1)).unwrap());
        assert!(!cache.put(CacheEntry::new("gml-1", 9, TypeTag::Road)).unwrap());

        cache.drain(usize::MAX).unwrap();
        assert!(!cache.put(CacheEntry::new("gml-1", 9, TypeTag::Road)).unwrap());
        assert_eq!(cache.lookup("gml-1").unwrap(), Some(entry_for(1)));
    }

    #[test]
    fn reverse_lookup_covers_every_partition() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, settings(5));
        for i in 0..100 {
            cache.put(entry_for(i)).unwrap();
        }
        let touched: FxHashSet<usize> = (0..100)
            .map(|i| cache.partition_of(&format!("gml-{i}")))
            .collect();
        assert_eq!(touched.len(), 5);

        for i in 0..100 {
            assert_eq!(
                cache.lookup_by_internal_id(1000 + i, TypeTag::Building).unwrap(),
                Some(format!("gml-{i}"))
            );
        }

        cache.drain(60).unwrap();
        for i in 0..100 {
            assert_eq!(
                cache.lookup_by_internal_id(1000 + i, TypeTag::Building).unwrap(),
                Some(format!("gml-{i}"))
            );
        }
        assert_eq!(cache.lookup_by_internal_id(1000, TypeTag::Road).unwrap(), None);
    }

    #[test]
    fn reverse_index_follows_removal_and_drain() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, settings(3));
        for i in 0..20 {
            cache.put(entry_for(i)).unwrap();
        }
        let indexed: usize = (0..3).map(|p| cache.lock(p).by_internal.len()).sum();
        assert_eq!(indexed, 20);

        assert!(cache.remove("gml-4").unwrap());
        assert_eq!(cache.lookup_by_internal_id(1004, TypeTag::Building).unwrap(), None);
        assert_eq!(cache.in_memory_len(), 19);

        cache.drain(usize::MAX).unwrap();
        let indexed: usize = (0..3).map(|p| cache.lock(p).by_internal.len()).sum();
        assert_eq!(indexed, 0);
        assert_eq!(
            cache.lookup_by_internal_id(1005, TypeTag::Building).unwrap(),
            Some("gml-5".to_string())
        );

        assert!(cache.remove("gml-5").unwrap());
        assert_eq!(cache.lookup("gml-5").unwrap(), None);
        assert!(!cache.remove("gml-5").unwrap());
        assert!(cache.put(CacheEntry::new("gml-5", 77, TypeTag::Road)).unwrap());
    }

    #[test]
    fn find_leaves_no_pending_requests() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, settings(4));
        for i in 0..500 {
            assert_eq!(cache.find(&format!("never-{i}")).unwrap(), None);
        }
        assert_eq!(cache.pending_len(), 0);

        cache.put(entry_for(1)).unwrap();
        cache.find("gml-1").unwrap();
        let partition = cache.lock(cache.partition_of("gml-1"));
        assert!(!partition.entries["gml-1"].requested);
    }

    #[test]
    fn pending_requests_are_bounded_by_clear() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, settings(4));
        for i in 0..300 {
            cache.lookup(&format!("missing-{i}")).unwrap();
        }
        assert_eq!(cache.pending_len(), 300);

        // A later put consumes its request.
        cache.put(CacheEntry::new("missing-7", 7, TypeTag::Building)).unwrap();
        assert_eq!(cache.pending_len(), 299);

        assert_eq!(cache.clear_pending(), 299);
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn batch_size_comes_from_the_adapter() {
        let adapter = SqliteAdapter::new("unused.db").with_batch_size(17);
        let settings = CacheSettings::from_config(&PipelineConfig::default(), &adapter);
        assert_eq!(settings.batch_size, 17);
        assert_eq!(settings.drain_threshold, PipelineConfig::default().drain_threshold);
    }

    #[test]
    fn exceeding_threshold_drains_automatically() {
        let dir = TempDir::new().unwrap();
        let cache = cache(
            &dir,
            CacheSettings {
                drain_threshold: 10,
                drain_batch: 8,
                ..settings(2)
            },
        );
        for i in 0..11 {
            cache.put(entry_for(i)).unwrap();
        }
        assert!(cache.drained() >= 8);
        assert!(cache.in_memory_len() <= 3);
        for i in 0..11 {
            assert_eq!(cache.lookup(&format!("gml-{i}")).unwrap(), Some(entry_for(i)));
        }
    }

    #[test]
    fn full_tables_branch() {
        let dir = TempDir::new().unwrap();
        let cache = cache(
            &dir,
            CacheSettings {
                max_rows_per_table: 5,
                ..settings(1)
            },
        );
        for i in 0..5 {
            cache.put(entry_for(i)).unwrap();
        }
        cache.drain(usize::MAX).unwrap();
        for i in 5..10 {
            cache.put(entry_for(i)).unwrap();
        }
        cache.drain(usize::MAX).unwrap();

        assert_eq!(cache.lock(0).table.as_ref().map(CacheTable::branch_count), Some(1));
        for i in 0..10 {
            assert_eq!(cache.lookup(&format!("gml-{i}")).unwrap(), Some(entry_for(i)));
        }
    }

    #[test]
    fn concurrent_puts_and_lookups() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(cache(
            &dir,
            CacheSettings {
                drain_threshold: 150,
                drain_batch: 100,
                ..settings(4)
            },
        ));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in (t * 100)..((t + 1) * 100) {
                        assert!(cache.put(entry_for(i)).unwrap());
                        assert_eq!(cache.lookup(&format!("gml-{i}")).unwrap(), Some(entry_for(i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..400 {
            assert_eq!(cache.lookup(&format!("gml-{i}")).unwrap(), Some(entry_for(i)));
        }
        // Every put is counted once and every drained entry uncounted once.
        assert_eq!(cache.in_memory_len() as u64 + cache.drained(), 400);
        let held: usize = (0..4).map(|p| cache.lock(p).entries.len()).sum();
        assert_eq!(cache.in_memory_len(), held);
    }

    #[test]
    fn drop_tables_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, settings(3));
        cache.drop_tables().unwrap();
        for i in 0..30 {
            cache.put(entry_for(i)).unwrap();
        }
        cache.drain(usize::MAX).unwrap();
        assert!(!cache.store.live_tables().is_empty());

        cache.drop_tables().unwrap();
        cache.drop_tables().unwrap();
        assert!(cache.store.live_tables().is_empty());
    }
}
