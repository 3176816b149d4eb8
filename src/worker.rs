//! Primary and secondary worker bodies run inside a [`crate::pool::WorkerPool`].

use crate::context::RunContext;
use crate::error::PipelineError;
use crate::events::{CounterKind, Event};
use crate::id_cache::IdCache;
use crate::models::{Outcome, TypeTag, WorkUnit};
use crate::pool::Worker;
use crate::sink::{OrderedSink, OutputSink};
use crate::tiling::TileFilter;
use crate::xlink::{DeferredQueue, DeferredReference, ResolverRegistry};
use rusqlite::Connection;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Turns one work unit into at most one output object.
///
/// Each primary worker owns its own transformer, so implementations may keep
/// per-worker state (prepared statements, scratch buffers) without locking.
pub trait UnitTransformer: Send + 'static {
    type Payload: Send + 'static;
    type Output: Send + 'static;

    /// `Ok(None)` means the unit produced nothing and becomes a tombstone.
    fn transform(
        &mut self,
        unit: &WorkUnit<Self::Payload>,
        cx: &mut UnitContext<'_>,
    ) -> Result<Option<Self::Output>, PipelineError>;

    fn finish(&mut self, _conn: &Connection) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// What a transformer may touch while handling one unit.
pub struct UnitContext<'a> {
    conn: &'a Connection,
    ids: &'a IdCache,
    deferred: &'a DeferredQueue,
    deferred_count: u64,
    geometries: u64,
}

impl<'a> UnitContext<'a> {
    pub fn new(conn: &'a Connection, ids: &'a IdCache, deferred: &'a DeferredQueue) -> Self {
        Self {
            conn,
            ids,
            deferred,
            deferred_count: 0,
            geometries: 0,
        }
    }

    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    pub fn ids(&self) -> &'a IdCache {
        self.ids
    }

    /// Queues a reference for the secondary pass.
    pub fn defer(&mut self, reference: DeferredReference) -> Result<(), PipelineError> {
        self.defer_all(vec![reference])
    }

    /// Queues all of a unit's references at once; on error none of them
    /// were queued.
    pub fn defer_all(&mut self, references: Vec<DeferredReference>) -> Result<(), PipelineError> {
        let count = references.len() as u64;
        self.deferred.push_all(references)?;
        self.deferred_count += count;
        Ok(())
    }

    pub fn add_geometries(&mut self, count: u64) {
        self.geometries += count;
    }
}

/// Counts accumulated between two publishes.
#[derive(Default)]
struct LocalCounters {
    units: u64,
    filtered: u64,
    failed: u64,
    deferred: u64,
    resolved: u64,
    skipped: u64,
    geometries: u64,
    objects: FxHashMap<TypeTag, u64>,
}

impl LocalCounters {
    fn publish(&mut self, ctx: &RunContext) {
        let counters = [
            (CounterKind::Units, self.units),
            (CounterKind::Filtered, self.filtered),
            (CounterKind::Failed, self.failed),
            (CounterKind::Deferred, self.deferred),
            (CounterKind::Resolved, self.resolved),
            (CounterKind::Skipped, self.skipped),
            (CounterKind::Geometries, self.geometries),
        ];
        for (kind, delta) in counters {
            if delta > 0 {
                ctx.events().publish(Event::Counter { kind, delta });
            }
        }
        for (type_tag, count) in self.objects.drain() {
            ctx.events().publish(Event::ObjectCount { type_tag, count });
        }
        *self = Self::default();
    }
}

pub struct PrimaryWorker<T: UnitTransformer, S: OutputSink<Item = T::Output>> {
    id: usize,
    conn: Connection,
    transformer: T,
    ctx: Arc<RunContext>,
    ids: Arc<IdCache>,
    deferred: Arc<DeferredQueue>,
    sink: Arc<OrderedSink<S>>,
    filter: Option<TileFilter>,
    counters: LocalCounters,
    since_publish: u64,
}

impl<T, S> PrimaryWorker<T, S>
where
    T: UnitTransformer,
    S: OutputSink<Item = T::Output> + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        conn: Connection,
        transformer: T,
        ctx: Arc<RunContext>,
        ids: Arc<IdCache>,
        deferred: Arc<DeferredQueue>,
        sink: Arc<OrderedSink<S>>,
        filter: Option<TileFilter>,
    ) -> Self {
        Self {
            id,
            conn,
            transformer,
            ctx,
            ids,
            deferred,
            sink,
            filter,
            counters: LocalCounters::default(),
            since_publish: 0,
        }
    }

    fn handle(&mut self, unit: &WorkUnit<T::Payload>) -> Result<Option<T::Output>, PipelineError> {
        if let Some(filter) = &self.filter {
            if !filter.admits(unit.envelope.as_ref(), self.ctx.adapter().as_ref())? {
                self.counters.filtered += 1;
                return Ok(None);
            }
        }
        let mut cx = UnitContext::new(&self.conn, &self.ids, &self.deferred);
        let result = self.transformer.transform(unit, &mut cx);
        self.counters.deferred += cx.deferred_count;
        self.counters.geometries += cx.geometries;
        result
    }

    /// Aborts on fatal errors; otherwise logs and returns `false`.
    fn fail(&mut self, err: &PipelineError, unit: &WorkUnit<T::Payload>) -> bool {
        if self.ctx.policy().is_fatal(err) {
            self.ctx.abort(err, Some(&unit.describe()));
            return true;
        }
        warn!(
            external_id = %unit.external_id,
            type_tag = %unit.type_tag,
            sequence = unit.sequence,
            error = %format!("{err:#}"),
            "Failed to process unit"
        );
        self.counters.failed += 1;
        false
    }
}

impl<T, S> Worker for PrimaryWorker<T, S>
where
    T: UnitTransformer,
    S: OutputSink<Item = T::Output> + 'static,
{
    type Item = WorkUnit<T::Payload>;

    fn process(&mut self, unit: WorkUnit<T::Payload>) {
        self.counters.units += 1;
        let outcome = match self.handle(&unit) {
            Ok(Some(object)) => {
                *self.counters.objects.entry(unit.type_tag).or_insert(0) += 1;
                Outcome::Finished(object)
            }
            Ok(None) => Outcome::Tombstone,
            Err(e) => {
                if self.fail(&e, &unit) {
                    return;
                }
                Outcome::Tombstone
            }
        };
        if let Err(e) = self.sink.submit(unit.sequence, outcome) {
            self.fail(&e, &unit);
        }

        self.since_publish += 1;
        if self.since_publish >= self.ctx.config().counter_interval {
            self.counters.publish(&self.ctx);
            self.since_publish = 0;
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.transformer.finish(&self.conn) {
            if self.ctx.policy().is_fatal(&e) {
                self.ctx.abort(&e, None);
            } else {
                warn!(worker = self.id, error = %format!("{e:#}"), "Transformer cleanup failed");
            }
        }
        self.counters.publish(&self.ctx);
        debug!(worker = self.id, "Primary worker finished");
    }
}

/// Secondary worker: resolves deferred references by kind.
pub struct XlinkWorker {
    id: usize,
    conn: Connection,
    ctx: Arc<RunContext>,
    ids: Arc<IdCache>,
    resolvers: Arc<ResolverRegistry>,
    counters: LocalCounters,
    since_publish: u64,
}

impl XlinkWorker {
    pub fn new(
        id: usize,
        conn: Connection,
        ctx: Arc<RunContext>,
        ids: Arc<IdCache>,
        resolvers: Arc<ResolverRegistry>,
    ) -> Self {
        Self {
            id,
            conn,
            ctx,
            ids,
            resolvers,
            counters: LocalCounters::default(),
            since_publish: 0,
        }
    }
}

impl Worker for XlinkWorker {
    type Item = DeferredReference;

    fn process(&mut self, reference: DeferredReference) {
        let result = self
            .resolvers
            .get(reference.kind)
            .and_then(|resolver| resolver.resolve(&self.conn, &reference, &self.ids));
        match result {
            Ok(()) => self.counters.resolved += 1,
            Err(e) if self.ctx.policy().is_fatal(&e) => {
                let unit = format!("{} reference to {}", reference.kind, reference.target);
                self.ctx.abort(&e, Some(&unit));
                return;
            }
            Err(e) => {
                warn!(
                    kind = %reference.kind,
                    target = %reference.target,
                    source_row = reference.source_row,
                    error = %format!("{e:#}"),
                    "Dropping unresolvable reference"
                );
                self.counters.skipped += 1;
            }
        }

        self.since_publish += 1;
        if self.since_publish >= self.ctx.config().counter_interval {
            self.counters.publish(&self.ctx);
            self.since_publish = 0;
        }
    }

    fn finish(&mut self) {
        self.counters.publish(&self.ctx);
        debug!(worker = self.id, "Xlink worker finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_table::CacheTableStore;
    use crate::config::PipelineConfig;
    use crate::db::{DatabaseAdapter, SqliteAdapter};
    use crate::events::EventType;
    use crate::id_cache::CacheSettings;
    use crate::models::Envelope;
    use crate::schema::ensure_schema;
    use crate::stats::PipelineStats;
    use crate::tiling::TilingConfig;
    use crate::xlink::{LocalAssetFetcher, ReferenceKind};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collect(Vec<(u64, String)>);

    impl OutputSink for Collect {
        type Item = String;

        fn write(&mut self, sequence: u64, item: String) -> Result<(), PipelineError> {
            self.0.push((sequence, item));
            Ok(())
        }
    }

    /// Fails on ids starting with `bad`, dies on `fatal`, defers on `ref`.
    struct Echo;

    impl UnitTransformer for Echo {
        type Payload = ();
        type Output = String;

        fn transform(
            &mut self,
            unit: &WorkUnit<()>,
            cx: &mut UnitContext<'_>,
        ) -> Result<Option<String>, PipelineError> {
            if unit.external_id.starts_with("bad") {
                return Err(PipelineError::Malformed {
                    external_id: unit.external_id.clone(),
                    type_tag: unit.type_tag.to_string(),
                    reason: "no geometry".to_string(),
                });
            }
            if unit.external_id == "fatal" {
                return Err(PipelineError::Internal("lost state".to_string()));
            }
            if unit.external_id.starts_with("ref") {
                cx.defer(DeferredReference::new(ReferenceKind::ParentLink, 1, "parent"))?;
            }
            cx.add_geometries(2);
            Ok(Some(unit.external_id.clone()))
        }
    }

    struct Harness {
        _dir: TempDir,
        ctx: Arc<RunContext>,
        ids: Arc<IdCache>,
        deferred: Arc<DeferredQueue>,
        stats: Arc<PipelineStats>,
        _subs: [crate::events::Subscription; 2],
    }

    fn harness(config: PipelineConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let adapter: Arc<dyn DatabaseAdapter> =
            Arc::new(SqliteAdapter::new(dir.path().join("city.db")));
        let ctx = Arc::new(RunContext::new(config, Arc::clone(&adapter)));
        let store = Arc::new(CacheTableStore::new(adapter, ctx.run_id()));
        let ids = Arc::new(IdCache::new(
            Arc::clone(&store),
            CacheSettings::from_config(ctx.config(), ctx.adapter().as_ref()),
        ));
        let deferred = Arc::new(DeferredQueue::new(&store, 100));
        let stats = Arc::new(PipelineStats::new());
        let subs = stats.attach(ctx.events());
        Harness {
            _dir: dir,
            ctx,
            ids,
            deferred,
            stats,
            _subs: subs,
        }
    }

    fn unit(seq: u64, id: &str, envelope: Option<Envelope>) -> WorkUnit<()> {
        WorkUnit {
            external_id: id.to_string(),
            type_tag: TypeTag::Building,
            envelope,
            sequence: seq,
            payload: (),
        }
    }

    fn primary(h: &Harness, sink: &Arc<OrderedSink<Collect>>, filter: Option<TileFilter>) -> PrimaryWorker<Echo, Collect> {
        let conn = h.ctx.adapter().connect().unwrap();
        PrimaryWorker::new(
            0,
            conn,
            Echo,
            Arc::clone(&h.ctx),
            Arc::clone(&h.ids),
            Arc::clone(&h.deferred),
            Arc::clone(sink),
            filter,
        )
    }

    #[test]
    fn recoverable_failure_becomes_tombstone() {
        let h = harness(PipelineConfig::default());
        let sink = Arc::new(OrderedSink::new(Collect::default(), 0));
        let mut worker = primary(&h, &sink, None);

        worker.process(unit(0, "a", None));
        worker.process(unit(1, "bad-1", None));
        worker.process(unit(2, "ref-c", None));
        worker.finish();
        drop(worker);
        h.ctx.events().shutdown();

        assert!(h.ctx.should_continue());
        assert_eq!(sink.next_expected(), 3);
        let snap = h.stats.snapshot();
        assert_eq!(snap.units_processed, 3);
        assert_eq!(snap.units_failed, 1);
        assert_eq!(snap.references_deferred, 1);
        assert_eq!(snap.geometries, 4);
        assert_eq!(snap.objects_by_type, vec![(TypeTag::Building, 2)]);
        assert_eq!(h.deferred.pushed(), 1);

        let sink = Arc::try_unwrap(sink).ok().unwrap();
        let written: Vec<String> = sink.into_inner().0.into_iter().map(|(_, s)| s).collect();
        assert_eq!(written, vec!["a", "ref-c"]);
    }

    #[test]
    fn fatal_failure_aborts_without_tombstone() {
        let h = harness(PipelineConfig::default());
        let aborted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&aborted);
        let _sub = h.ctx.events().subscribe(
            EventType::Abort,
            move |event| {
                if let Event::Abort { unit, .. } = event {
                    assert_eq!(unit.as_deref(), Some("Building 'fatal' (#1)"));
                    flag.store(true, Ordering::SeqCst);
                }
            },
            false,
        );
        let sink = Arc::new(OrderedSink::new(Collect::default(), 0));
        let mut worker = primary(&h, &sink, None);

        worker.process(unit(0, "a", None));
        worker.process(unit(1, "fatal", None));

        assert!(aborted.load(Ordering::SeqCst));
        assert!(!h.ctx.should_continue());
        assert_eq!(sink.next_expected(), 1);
    }

    #[test]
    fn tile_filter_runs_before_transform() {
        let config = PipelineConfig::default();
        let h = harness(config);
        let filter = TileFilter::new(&TilingConfig {
            extent: [0.0, 0.0, 10.0, 10.0],
            srid: 3857,
            rows: 1,
            columns: 2,
            row: 0,
            column: 0,
        });
        let sink = Arc::new(OrderedSink::new(Collect::default(), 0));
        let mut worker = primary(&h, &sink, Some(filter));

        worker.process(unit(0, "inside", Some(Envelope::new(1.0, 1.0, 2.0, 2.0, 3857))));
        worker.process(unit(1, "outside", Some(Envelope::new(8.0, 1.0, 9.0, 2.0, 3857))));
        // Would fail if transformed; the filter must drop it first.
        worker.process(unit(2, "bad-no-envelope", None));
        worker.finish();
        drop(worker);
        h.ctx.events().shutdown();

        let snap = h.stats.snapshot();
        assert_eq!(snap.units_filtered, 2);
        assert_eq!(snap.units_failed, 0);
        let sink = Arc::try_unwrap(sink).ok().unwrap();
        assert_eq!(sink.into_inner().0, vec![(0, "inside".to_string())]);
    }

    #[test]
    fn xlink_worker_counts_resolved_and_skipped() {
        let h = harness(PipelineConfig::default());
        let conn = h.ctx.adapter().connect().unwrap();
        ensure_schema(&conn).unwrap();
        conn.execute("INSERT INTO city_object (id, gmlid, type_tag) VALUES (1, 'child', 26)", [])
            .unwrap();
        h.ids
            .put(crate::models::CacheEntry::new("parent", 9, TypeTag::Building))
            .unwrap();

        let registry = Arc::new(ResolverRegistry::with_defaults(LocalAssetFetcher::new(
            h._dir.path(),
        )));
        let mut worker = XlinkWorker::new(0, conn, Arc::clone(&h.ctx), Arc::clone(&h.ids), registry);
        worker.process(DeferredReference::new(ReferenceKind::ParentLink, 1, "parent"));
        worker.process(DeferredReference::new(ReferenceKind::ExternalAsset, 1, "missing.png"));
        worker.process(DeferredReference::new(ReferenceKind::SharedAppearance, 1, "nobody"));
        worker.finish();
        drop(worker);
        h.ctx.events().shutdown();

        assert!(h.ctx.should_continue());
        let snap = h.stats.snapshot();
        assert_eq!(snap.references_resolved, 1);
        assert_eq!(snap.references_skipped, 2);
    }
}
