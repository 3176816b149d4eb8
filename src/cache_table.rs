//! Ephemeral database tables used as overflow storage for in-memory caches.
//!
//! A [`CacheTable`] owns the connection it reads through. Writes either go
//! through that same connection or, after [`CacheTable::decouple_writer`],
//! through a separate [`CacheTableWriter`] that can live on another thread.
//! Tables are dropped explicitly at run end and, as a fallback, when the
//! handle itself is dropped; [`CacheTableStore::drop_all`] removes anything
//! that is still registered.

use crate::db::DatabaseAdapter;
use crate::error::PipelineError;
use once_cell::sync::OnceCell;
use rusqlite::Connection;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Row layout of a cache table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTableModel {
    /// External id to internal row id mapping
    IdMapping,
    /// Spilled deferred references awaiting resolution
    DeferredReferences,
}

impl CacheTableModel {
    pub const fn columns(self) -> &'static str {
        match self {
            CacheTableModel::IdMapping => {
                "external_id TEXT NOT NULL, \
                 internal_id INTEGER NOT NULL, \
                 root_id INTEGER NOT NULL, \
                 reverse INTEGER NOT NULL, \
                 mapping TEXT, \
                 type_tag INTEGER NOT NULL"
            }
            CacheTableModel::DeferredReferences => {
                "kind INTEGER NOT NULL, \
                 source_row INTEGER NOT NULL, \
                 target TEXT NOT NULL"
            }
        }
    }

    pub const fn index_columns(self) -> &'static [&'static str] {
        match self {
            CacheTableModel::IdMapping => &["external_id", "internal_id, type_tag"],
            CacheTableModel::DeferredReferences => &["kind"],
        }
    }

    const fn prefix(self) -> &'static str {
        match self {
            CacheTableModel::IdMapping => "ids",
            CacheTableModel::DeferredReferences => "xlinks",
        }
    }
}

/// Hands out uniquely named cache tables for one run and remembers which
/// ones still exist.
pub struct CacheTableStore {
    adapter: Arc<dyn DatabaseAdapter>,
    run_id: String,
    counter: AtomicUsize,
    live: Arc<Mutex<FxHashSet<String>>>,
}

impl CacheTableStore {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, run_id: impl Into<String>) -> Self {
        Self {
            adapter,
            run_id: sanitize(&run_id.into()),
            counter: AtomicUsize::new(0),
            live: Arc::new(Mutex::new(FxHashSet::default())),
        }
    }

    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.adapter
    }

    pub fn create(&self, model: CacheTableModel) -> Result<CacheTable, PipelineError> {
        self.create_table(model, false)
    }

    pub fn create_indexed(&self, model: CacheTableModel) -> Result<CacheTable, PipelineError> {
        self.create_table(model, true)
    }

    /// A table that is only created when first accessed.
    pub fn lazy(self: &Arc<Self>, model: CacheTableModel, indexed: bool) -> LazyCacheTable {
        LazyCacheTable {
            store: Arc::clone(self),
            model,
            indexed,
            cell: OnceCell::new(),
        }
    }

    fn create_table(
        &self,
        model: CacheTableModel,
        indexed: bool,
    ) -> Result<CacheTable, PipelineError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("tmp_{}_{}_{n}", model.prefix(), self.run_id);
        CacheTable::open(
            Arc::clone(&self.adapter),
            Arc::clone(&self.live),
            name,
            model,
            indexed,
        )
    }

    pub fn live_tables(&self) -> Vec<String> {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = live.iter().cloned().collect();
        names.sort();
        names
    }

    /// Drops every table this store created that has not been dropped yet.
    pub fn drop_all(&self) -> Result<usize, PipelineError> {
        let names: Vec<String> = {
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            live.drain().collect()
        };
        if names.is_empty() {
            return Ok(0);
        }
        let conn = self.adapter.connect()?;
        for name in &names {
            self.adapter.drop_table(&conn, name)?;
        }
        debug!(count = names.len(), "Dropped leftover cache tables");
        Ok(names.len())
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// One physical table bound to one connection.
struct TableHandle {
    name: String,
    conn: Connection,
}

pub struct CacheTable {
    adapter: Arc<dyn DatabaseAdapter>,
    live: Arc<Mutex<FxHashSet<String>>>,
    model: CacheTableModel,
    indexed: bool,
    base: TableHandle,
    branches: Vec<TableHandle>,
    dropped: bool,
}

impl CacheTable {
    fn open(
        adapter: Arc<dyn DatabaseAdapter>,
        live: Arc<Mutex<FxHashSet<String>>>,
        name: String,
        model: CacheTableModel,
        indexed: bool,
    ) -> Result<Self, PipelineError> {
        let base = create_handle(adapter.as_ref(), &live, name, model, indexed)?;
        debug!(table = %base.name, "Created cache table");
        Ok(Self {
            adapter,
            live,
            model,
            indexed,
            base,
            branches: Vec::new(),
            dropped: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.base.name
    }

    pub fn model(&self) -> CacheTableModel {
        self.model
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    /// The base table's reader connection.
    pub fn connection(&self) -> &Connection {
        &self.base.conn
    }

    /// Base table followed by its branches, as `(name, connection)` pairs.
    pub fn tables(&self) -> impl Iterator<Item = (&str, &Connection)> {
        std::iter::once(&self.base)
            .chain(self.branches.iter())
            .map(|h| (h.name.as_str(), &h.conn))
    }

    /// The most recently created physical table.
    pub fn latest(&self) -> (&str, &Connection) {
        let handle = self.branches.last().unwrap_or(&self.base);
        (handle.name.as_str(), &handle.conn)
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Creates a sibling table with its own connection and the same layout.
    pub fn branch(&mut self) -> Result<&str, PipelineError> {
        let name = format!("{}_b{}", self.base.name, self.branches.len() + 1);
        let handle = create_handle(
            self.adapter.as_ref(),
            &self.live,
            name,
            self.model,
            self.indexed,
        )?;
        debug!(table = %handle.name, "Branched cache table");
        self.branches.push(handle);
        Ok(self.branches.last().map_or("", |h| h.name.as_str()))
    }

    /// Opens a dedicated writer connection for the base table.
    pub fn decouple_writer(&self) -> Result<CacheTableWriter, PipelineError> {
        let conn = self.adapter.connect()?;
        Ok(CacheTableWriter {
            name: self.base.name.clone(),
            conn,
        })
    }

    /// Drops the base table and all branches. Safe to call repeatedly.
    pub fn drop_table(&mut self) -> Result<(), PipelineError> {
        if self.dropped {
            return Ok(());
        }
        self.dropped = true;
        for handle in self.branches.iter().chain(std::iter::once(&self.base)) {
            self.adapter.drop_table(&handle.conn, &handle.name)?;
            self.live
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&handle.name);
        }
        debug!(table = %self.base.name, branches = self.branches.len(), "Dropped cache table");
        Ok(())
    }
}

impl Drop for CacheTable {
    fn drop(&mut self) {
        if let Err(e) = self.drop_table() {
            warn!(table = %self.base.name, error = %e, "Failed to drop cache table");
        }
    }
}

fn create_handle(
    adapter: &dyn DatabaseAdapter,
    live: &Mutex<FxHashSet<String>>,
    name: String,
    model: CacheTableModel,
    indexed: bool,
) -> Result<TableHandle, PipelineError> {
    let conn = adapter.connect()?;
    adapter.create_table(&conn, &name, model, indexed)?;
    live.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.clone());
    Ok(TableHandle { name, conn })
}

/// Write role of a cache table, on its own connection.
///
/// Owned separately from the [`CacheTable`] so one thread can write while
/// another reads. Writes after the table has been dropped fail with a
/// database error.
pub struct CacheTableWriter {
    name: String,
    conn: Connection,
}

impl CacheTableWriter {
    pub fn table_name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// A cache table that is created on first access.
pub struct LazyCacheTable {
    store: Arc<CacheTableStore>,
    model: CacheTableModel,
    indexed: bool,
    cell: OnceCell<Mutex<CacheTable>>,
}

impl LazyCacheTable {
    pub fn get(&self) -> Result<&Mutex<CacheTable>, PipelineError> {
        self.cell.get_or_try_init(|| {
            let table = if self.indexed {
                self.store.create_indexed(self.model)?
            } else {
                self.store.create(self.model)?
            };
            Ok(Mutex::new(table))
        })
    }

    pub fn is_created(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Drops the table if it was ever created; a no-op otherwise.
    pub fn drop_table(&self) -> Result<(), PipelineError> {
        match self.cell.get() {
            Some(table) => table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drop_table(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteAdapter;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Arc<CacheTableStore> {
        let adapter: Arc<dyn DatabaseAdapter> =
            Arc::new(SqliteAdapter::new(dir.path().join("cache.db")));
        Arc::new(CacheTableStore::new(adapter, "run-1"))
    }

    fn table_exists(store: &CacheTableStore, name: &str) -> bool {
        let conn = store.adapter().connect().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get(0),
            )
            .unwrap();
        count == 1
    }

    #[test]
    fn tables_get_unique_names() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let a = store.create(CacheTableModel::IdMapping).unwrap();
        let b = store.create_indexed(CacheTableModel::IdMapping).unwrap();
        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("tmp_ids_run_1_"));
        assert_eq!(store.live_tables().len(), 2);
    }

    #[test]
    fn drop_table_twice_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut table = store.create(CacheTableModel::IdMapping).unwrap();
        let name = table.name().to_string();
        assert!(table_exists(&store, &name));

        table.drop_table().unwrap();
        assert!(table.is_dropped());
        assert!(!table_exists(&store, &name));
        table.drop_table().unwrap();
        assert!(store.live_tables().is_empty());
    }

    #[test]
    fn dropping_the_handle_drops_the_table() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let name = {
            let table = store.create(CacheTableModel::DeferredReferences).unwrap();
            table.name().to_string()
        };
        assert!(!table_exists(&store, &name));
    }

    #[test]
    fn lazy_table_never_created_drops_cleanly() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let lazy = store.lazy(CacheTableModel::IdMapping, true);
        assert!(!lazy.is_created());
        lazy.drop_table().unwrap();
        lazy.drop_table().unwrap();
        assert!(store.live_tables().is_empty());
    }

    #[test]
    fn lazy_table_created_on_first_access() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let lazy = store.lazy(CacheTableModel::IdMapping, false);
        let name = lazy.get().unwrap().lock().unwrap().name().to_string();
        assert!(lazy.is_created());
        assert!(table_exists(&store, &name));
        lazy.drop_table().unwrap();
        assert!(!table_exists(&store, &name));
    }

    #[test]
    fn branches_share_layout_and_drop_together() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut table = store.create_indexed(CacheTableModel::IdMapping).unwrap();
        let branch = table.branch().unwrap().to_string();
        assert_eq!(branch, format!("{}_b1", table.name()));
        assert_eq!(table.branch_count(), 1);
        assert_eq!(table.latest().0, branch);
        assert_eq!(table.tables().count(), 2);

        let (_, conn) = table.latest();
        conn.execute(
            &format!(
                "INSERT INTO \"{branch}\" (external_id, internal_id, root_id, reverse, type_tag) \
                 VALUES ('a', 1, 1, 0, 26)"
            ),
            [],
        )
        .unwrap();

        table.drop_table().unwrap();
        assert!(!table_exists(&store, &branch));
    }

    #[test]
    fn decoupled_writer_is_visible_to_reader() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = store.create(CacheTableModel::DeferredReferences).unwrap();
        let writer = table.decouple_writer().unwrap();
        assert_eq!(writer.table_name(), table.name());

        let handle = std::thread::spawn(move || {
            writer
                .connection()
                .execute(
                    &format!(
                        "INSERT INTO \"{}\" (kind, source_row, target) VALUES (1, 7, 'x')",
                        writer.table_name()
                    ),
                    [],
                )
                .unwrap();
        });
        handle.join().unwrap();

        let count: i64 = table
            .connection()
            .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table.name()), [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn drop_all_removes_leftovers() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = store.create(CacheTableModel::IdMapping).unwrap();
        let name = table.name().to_string();
        // Simulate an abort path that leaks the handle.
        std::mem::forget(table);

        assert_eq!(store.drop_all().unwrap(), 1);
        assert!(!table_exists(&store, &name));
        assert_eq!(store.drop_all().unwrap(), 0);
    }
}
