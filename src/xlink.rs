//! Deferred cross-references and the resolvers that complete them.
//!
//! Primary workers push a [`DeferredReference`] whenever a reference cannot be
//! satisfied inline. The queue keeps a bounded in-memory buffer and spills the
//! overflow to a cache table through a decoupled writer connection. Once the
//! primary pass is over, the secondary pool drains the queue and dispatches
//! each reference to the resolver registered for its kind.

use crate::cache_table::{CacheTable, CacheTableModel, CacheTableStore, CacheTableWriter, LazyCacheTable};
use crate::db::execute_in_batches;
use crate::error::PipelineError;
use crate::id_cache::IdCache;
use once_cell::sync::OnceCell;
use rusqlite::{params, Connection};
use rustc_hash::FxHashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Rows fetched per query when reading spilled references back.
const SPILL_PAGE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Binary asset (texture, library object) addressed by URI
    ExternalAsset,
    /// Appearance shared by several city objects
    SharedAppearance,
    /// Child object whose parent was not yet stored
    ParentLink,
}

impl ReferenceKind {
    pub const fn code(self) -> i64 {
        match self {
            ReferenceKind::ExternalAsset => 1,
            ReferenceKind::SharedAppearance => 2,
            ReferenceKind::ParentLink => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ReferenceKind::ExternalAsset),
            2 => Some(ReferenceKind::SharedAppearance),
            3 => Some(ReferenceKind::ParentLink),
            _ => None,
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReferenceKind::ExternalAsset => "external-asset",
            ReferenceKind::SharedAppearance => "shared-appearance",
            ReferenceKind::ParentLink => "parent-link",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredReference {
    pub kind: ReferenceKind,
    /// Row that owns the reference
    pub source_row: i64,
    /// External id or URI being referenced
    pub target: String,
}

impl DeferredReference {
    pub fn new(kind: ReferenceKind, source_row: i64, target: impl Into<String>) -> Self {
        Self {
            kind,
            source_row,
            target: target.into(),
        }
    }
}

pub struct DeferredQueue {
    buffer: Mutex<Vec<DeferredReference>>,
    spill: LazyCacheTable,
    writer: OnceCell<Mutex<CacheTableWriter>>,
    spill_threshold: usize,
    pushed: AtomicU64,
    spilled: AtomicU64,
}

impl DeferredQueue {
    pub fn new(store: &Arc<CacheTableStore>, spill_threshold: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            spill: store.lazy(CacheTableModel::DeferredReferences, false),
            writer: OnceCell::new(),
            spill_threshold: spill_threshold.max(1),
            pushed: AtomicU64::new(0),
            spilled: AtomicU64::new(0),
        }
    }

    pub fn push(&self, reference: DeferredReference) -> Result<(), PipelineError> {
        self.push_all(vec![reference])
    }

    /// Queues all of `references` or none of them.
    ///
    /// When the buffer overflows, the whole buffer is spilled in one
    /// transaction. If that fails, references queued earlier (by any thread)
    /// go back to the buffer and only the caller's are rejected.
    pub fn push_all(&self, references: Vec<DeferredReference>) -> Result<(), PipelineError> {
        let count = references.len();
        if count == 0 {
            return Ok(());
        }
        let mut overflow = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.extend(references);
            if buffer.len() < self.spill_threshold {
                self.pushed.fetch_add(count as u64, Ordering::Relaxed);
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };
        if let Err(e) = self.spill_batch(&overflow) {
            // The caller's references are the tail of the overflow.
            overflow.truncate(overflow.len() - count);
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            let newer = std::mem::replace(&mut *buffer, overflow);
            buffer.extend(newer);
            return Err(e);
        }
        self.pushed.fetch_add(count as u64, Ordering::Relaxed);
        Ok(())
    }

    fn spill_batch(&self, batch: &[DeferredReference]) -> Result<(), PipelineError> {
        let writer = self.writer.get_or_try_init(|| {
            let table = self.spill.get()?;
            let writer = lock_table(table).decouple_writer()?;
            Ok::<_, PipelineError>(Mutex::new(writer))
        })?;
        let writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
        let sql = format!(
            "INSERT INTO \"{}\" (kind, source_row, target) VALUES (?1, ?2, ?3)",
            writer.table_name()
        );
        let written = execute_in_batches(writer.connection(), &sql, batch, batch.len(), |stmt, r| {
            stmt.execute(params![r.kind.code(), r.source_row, r.target])
        })?;
        self.spilled.fetch_add(written as u64, Ordering::Relaxed);
        debug!(table = writer.table_name(), written, "Spilled deferred references");
        Ok(())
    }

    /// References pushed since the queue was created.
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// References written to the spill table since the queue was created.
    pub fn spilled(&self) -> u64 {
        self.spilled.load(Ordering::Relaxed)
    }

    pub fn buffered(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Hands every queued reference to `consume`, buffered ones first.
    ///
    /// Stops early when `consume` returns `false`. Returns the number of
    /// references handed over. Each spilled reference is read once.
    pub fn drain<F>(&self, mut consume: F) -> Result<usize, PipelineError>
    where
        F: FnMut(DeferredReference) -> Result<bool, PipelineError>,
    {
        let buffered = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner));
        let mut handed = 0;
        for reference in buffered {
            handed += 1;
            if !consume(reference)? {
                return Ok(handed);
            }
        }
        if !self.spill.is_created() {
            return Ok(handed);
        }

        let table = self.spill.get()?;
        let mut after = 0i64;
        loop {
            let page = read_page(&lock_table(table), after)?;
            let Some((last, _)) = page.last() else {
                break;
            };
            after = *last;
            for (_, reference) in page {
                handed += 1;
                if !consume(reference)? {
                    return Ok(handed);
                }
            }
        }
        Ok(handed)
    }

    /// Drops the spill table if one was created.
    pub fn drop_table(&self) -> Result<(), PipelineError> {
        self.spill.drop_table()
    }
}

fn lock_table(table: &Mutex<CacheTable>) -> std::sync::MutexGuard<'_, CacheTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_page(table: &CacheTable, after: i64) -> Result<Vec<(i64, DeferredReference)>, PipelineError> {
    let sql = format!(
        "SELECT rowid, kind, source_row, target FROM \"{}\" WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
        table.name()
    );
    let mut stmt = table
        .connection()
        .prepare_cached(&sql)
        .map_err(|e| PipelineError::database("read spilled references", e))?;
    let rows = stmt
        .query_map(params![after, SPILL_PAGE as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(|e| PipelineError::database("read spilled references", e))?;

    let mut page = Vec::with_capacity(SPILL_PAGE);
    for row in rows {
        let (rowid, code, source_row, target) =
            row.map_err(|e| PipelineError::database("read spilled references", e))?;
        let kind = ReferenceKind::from_code(code)
            .ok_or_else(|| PipelineError::Internal(format!("unknown reference kind code {code}")))?;
        page.push((rowid, DeferredReference { kind, source_row, target }));
    }
    Ok(page)
}

/// Completes one kind of deferred reference on a secondary worker's
/// connection.
pub trait ReferenceResolver: Send + Sync {
    fn kind(&self) -> ReferenceKind;

    fn resolve(
        &self,
        conn: &Connection,
        reference: &DeferredReference,
        ids: &IdCache,
    ) -> Result<(), PipelineError>;
}

#[derive(Default, Clone)]
pub struct ResolverRegistry {
    resolvers: FxHashMap<ReferenceKind, Arc<dyn ReferenceResolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the three built-in resolvers.
    pub fn with_defaults<F: AssetFetcher + 'static>(fetcher: F) -> Self {
        let mut registry = Self::new();
        registry.register(ExternalAssetResolver::new(fetcher));
        registry.register(SharedAppearanceResolver);
        registry.register(ParentLinkResolver);
        registry
    }

    /// Registers a resolver, replacing any earlier one for the same kind.
    pub fn register<R: ReferenceResolver + 'static>(&mut self, resolver: R) {
        self.resolvers.insert(resolver.kind(), Arc::new(resolver));
    }

    pub fn get(&self, kind: ReferenceKind) -> Result<&dyn ReferenceResolver, PipelineError> {
        self.resolvers
            .get(&kind)
            .map(|r| r.as_ref())
            .ok_or_else(|| PipelineError::NoResolver {
                kind: kind.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

/// Source of external asset bytes.
pub trait AssetFetcher: Send + Sync {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>, PipelineError>;
}

/// Reads `file://` URIs and plain paths, relative ones against `base_dir`.
#[derive(Debug, Clone)]
pub struct LocalAssetFetcher {
    base_dir: PathBuf,
}

impl LocalAssetFetcher {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn locate(&self, uri: &str) -> Result<PathBuf, PipelineError> {
        let raw = uri.strip_prefix("file://").unwrap_or(uri);
        if raw.contains("://") {
            return Err(PipelineError::AssetFetch {
                uri: uri.to_string(),
                source: io::Error::new(io::ErrorKind::Unsupported, "unsupported URI scheme"),
            });
        }
        let path = Path::new(raw);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        })
    }
}

impl AssetFetcher for LocalAssetFetcher {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>, PipelineError> {
        let path = self.locate(uri)?;
        std::fs::read(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => PipelineError::AssetNotFound {
                uri: uri.to_string(),
            },
            _ => PipelineError::AssetFetch {
                uri: uri.to_string(),
                source,
            },
        })
    }
}

/// Fetches the referenced asset and stores its bytes once per URI.
pub struct ExternalAssetResolver<F> {
    fetcher: F,
}

impl<F: AssetFetcher> ExternalAssetResolver<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }
}

impl<F: AssetFetcher> ReferenceResolver for ExternalAssetResolver<F> {
    fn kind(&self) -> ReferenceKind {
        ReferenceKind::ExternalAsset
    }

    fn resolve(
        &self,
        conn: &Connection,
        reference: &DeferredReference,
        _ids: &IdCache,
    ) -> Result<(), PipelineError> {
        let data = self.fetcher.fetch(&reference.target)?;
        conn.prepare_cached(
            "INSERT OR IGNORE INTO external_asset (uri, owner_id, data) VALUES (?1, ?2, ?3)",
        )
        .and_then(|mut stmt| stmt.execute(params![reference.target, reference.source_row, data]))
        .map_err(|e| PipelineError::database("store external asset", e))?;
        Ok(())
    }
}

/// Links an appearance row to the object it targets.
pub struct SharedAppearanceResolver;

impl ReferenceResolver for SharedAppearanceResolver {
    fn kind(&self) -> ReferenceKind {
        ReferenceKind::SharedAppearance
    }

    fn resolve(
        &self,
        conn: &Connection,
        reference: &DeferredReference,
        ids: &IdCache,
    ) -> Result<(), PipelineError> {
        let target = resolve_target(reference, ids)?;
        conn.prepare_cached(
            "INSERT OR IGNORE INTO appearance_target (appearance_id, target_id) VALUES (?1, ?2)",
        )
        .and_then(|mut stmt| stmt.execute(params![reference.source_row, target]))
        .map_err(|e| PipelineError::database("link shared appearance", e))?;
        Ok(())
    }
}

/// Re-roots a subtree after its top row got a parent.
///
/// `?1` is the new parent, `?2` the child. The root is the topmost ancestor
/// of the parent as currently stored, so links that complete in any order
/// converge on the same root. `UNION` keeps a malformed cycle finite.
const REROOT_SUBTREE: &str = "
WITH RECURSIVE
    up(id, parent) AS (
        SELECT id, parent_id FROM city_object WHERE id = ?1
        UNION
        SELECT o.id, o.parent_id FROM city_object o JOIN up ON o.id = up.parent
    ),
    down(id) AS (
        SELECT ?2
        UNION
        SELECT o.id FROM city_object o JOIN down ON o.parent_id = down.id
    )
UPDATE city_object
SET root_id = COALESCE((SELECT id FROM up WHERE parent IS NULL LIMIT 1), ?1)
WHERE id IN (SELECT id FROM down)";

/// Sets the parent of a child row stored before its parent was known.
///
/// The child and everything below it take the root of the parent's chain,
/// which may itself have been linked by an earlier deferred reference.
pub struct ParentLinkResolver;

impl ReferenceResolver for ParentLinkResolver {
    fn kind(&self) -> ReferenceKind {
        ReferenceKind::ParentLink
    }

    fn resolve(
        &self,
        conn: &Connection,
        reference: &DeferredReference,
        ids: &IdCache,
    ) -> Result<(), PipelineError> {
        let parent_id = resolve_target(reference, ids)?;
        conn.prepare_cached("UPDATE city_object SET parent_id = ?1 WHERE id = ?2")
            .and_then(|mut stmt| stmt.execute(params![parent_id, reference.source_row]))
            .map_err(|e| PipelineError::database("link parent object", e))?;
        conn.prepare_cached(REROOT_SUBTREE)
            .and_then(|mut stmt| stmt.execute(params![parent_id, reference.source_row]))
            .map_err(|e| PipelineError::database("re-root linked subtree", e))?;
        Ok(())
    }
}

/// Internal id of the referenced object.
fn resolve_target(reference: &DeferredReference, ids: &IdCache) -> Result<i64, PipelineError> {
    ids.find(&reference.target)?
        .map(|entry| entry.internal_id)
        .ok_or_else(|| PipelineError::Unresolved {
            kind: reference.kind.to_string(),
            target: reference.target.clone(),
        })
}
