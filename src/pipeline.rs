//! Run orchestration: primary pass, ordered output, secondary xlink pass and
//! cleanup.

use crate::cache_table::CacheTableStore;
use crate::config::PipelineConfig;
use crate::context::RunContext;
use crate::db::DatabaseAdapter;
use crate::error::PipelineError;
use crate::events::{CounterKind, Event, EventType, Subscription};
use crate::id_cache::{CacheSettings, IdCache};
use crate::models::WorkUnit;
use crate::pool::WorkerPool;
use crate::schema::ensure_schema;
use crate::sink::{OrderedSink, OutputSink};
use crate::stats::{PipelineStats, RunReport, RunStatus};
use crate::tiling::TileFilter;
use crate::worker::{PrimaryWorker, UnitTransformer, XlinkWorker};
use crate::xlink::{DeferredQueue, LocalAssetFetcher, ResolverRegistry};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub type UnitIter<'a, P> = Box<dyn Iterator<Item = Result<WorkUnit<P>, PipelineError>> + 'a>;

/// Producer of work units.
///
/// Every call to [`WorkSource::units`] starts over from the beginning. Units
/// must carry contiguous sequence numbers starting at the run's
/// `first_sequence`.
pub trait WorkSource {
    type Payload: Send + 'static;

    fn units(&mut self) -> Result<UnitIter<'_, Self::Payload>, PipelineError>;
}

type Listener = (EventType, Arc<dyn Fn(&Event) + Send + Sync>);

pub struct Pipeline {
    config: PipelineConfig,
    adapter: Arc<dyn DatabaseAdapter>,
    resolvers: Arc<ResolverRegistry>,
    listeners: Vec<Listener>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, adapter: Arc<dyn DatabaseAdapter>) -> Result<Self, PipelineError> {
        config.validate()?;
        let base_dir = std::env::current_dir()?;
        Ok(Self {
            config,
            adapter,
            resolvers: Arc::new(ResolverRegistry::with_defaults(LocalAssetFetcher::new(base_dir))),
            listeners: Vec::new(),
        })
    }

    pub fn with_resolvers(mut self, resolvers: ResolverRegistry) -> Self {
        self.resolvers = Arc::new(resolvers);
        self
    }

    /// Registers a handler subscribed to every run's event bus.
    pub fn on_event<F>(mut self, event_type: EventType, handler: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners.push((event_type, Arc::new(handler)));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one complete pass over `source`.
    ///
    /// `make_transformer` is called once per primary worker. Only failures to
    /// prepare the target database are returned as errors; everything that
    /// goes wrong once workers run is reflected in the report.
    pub fn run<Src, T, F, S>(
        &self,
        source: &mut Src,
        mut make_transformer: F,
        sink: S,
    ) -> Result<(RunReport, S), PipelineError>
    where
        Src: WorkSource,
        T: UnitTransformer<Payload = Src::Payload>,
        F: FnMut(usize) -> T,
        S: OutputSink<Item = T::Output> + 'static,
    {
        let started = Instant::now();
        {
            let conn = self.adapter.connect()?;
            ensure_schema(&conn)?;
        }

        let ctx = Arc::new(RunContext::new(self.config.clone(), Arc::clone(&self.adapter)));
        info!(run_id = ctx.run_id(), workers = self.config.workers, "Starting run");

        let stats = Arc::new(PipelineStats::new());
        let _stats_subs = stats.attach(ctx.events());
        let _listener_subs: Vec<Subscription> = self
            .listeners
            .iter()
            .map(|(event_type, handler)| {
                let handler = Arc::clone(handler);
                ctx.events().subscribe(*event_type, move |e| handler(e), false)
            })
            .collect();

        let store = Arc::new(CacheTableStore::new(Arc::clone(&self.adapter), ctx.run_id()));
        let ids = Arc::new(IdCache::new(
            Arc::clone(&store),
            CacheSettings::from_config(&self.config, self.adapter.as_ref()),
        ));
        let deferred = Arc::new(DeferredQueue::new(&store, self.config.deferred_spill_threshold));
        let sink = Arc::new(OrderedSink::new(sink, self.config.first_sequence));

        let primary = self.run_primary(
            source,
            &mut make_transformer,
            &ctx,
            &ids,
            &deferred,
            &sink,
        );
        if let Err(e) = primary {
            ctx.abort(&e, None);
        }
        // Nothing produces ids after the primary pass.
        let unanswered = ids.clear_pending();
        if unanswered > 0 {
            debug!(unanswered, "Identifiers requested but never produced");
        }

        let discarded = match sink.flush() {
            Ok(discarded) => discarded,
            Err(e) => {
                ctx.abort(&e, None);
                0
            }
        };
        ctx.events().publish(Event::Counter {
            kind: CounterKind::Written,
            delta: sink.written(),
        });

        if ctx.should_continue() && deferred.pushed() > 0 {
            if let Err(e) = self.run_secondary(&ctx, &ids, &deferred) {
                ctx.abort(&e, None);
            }
        }

        let ids_drained = ids.drained();
        cleanup(&ids, &deferred, &store);
        ctx.events().shutdown();

        let status = match ctx.abort_cause() {
            Some(cause) => RunStatus::Aborted { cause },
            None => RunStatus::Completed,
        };
        let report = RunReport {
            status,
            stats: stats.snapshot(),
            elapsed: started.elapsed(),
            discarded,
            ids_drained,
        };
        info!(
            run_id = ctx.run_id(),
            completed = report.is_completed(),
            units = report.stats.units_processed,
            written = report.stats.objects_written,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Run finished"
        );

        let sink = Arc::try_unwrap(sink)
            .map_err(|_| PipelineError::Internal("output sink still shared after run".to_string()))?
            .into_inner();
        Ok((report, sink))
    }

    fn run_primary<Src, T, F, S>(
        &self,
        source: &mut Src,
        make_transformer: &mut F,
        ctx: &Arc<RunContext>,
        ids: &Arc<IdCache>,
        deferred: &Arc<DeferredQueue>,
        sink: &Arc<OrderedSink<S>>,
    ) -> Result<(), PipelineError>
    where
        Src: WorkSource,
        T: UnitTransformer<Payload = Src::Payload>,
        F: FnMut(usize) -> T,
        S: OutputSink<Item = T::Output> + 'static,
    {
        let filter = self.config.tiling.as_ref().map(TileFilter::new);
        let pool = WorkerPool::spawn(
            "primary",
            self.config.workers,
            self.config.queue_capacity,
            ctx,
            |id| {
                Ok(PrimaryWorker::new(
                    id,
                    self.adapter.connect()?,
                    make_transformer(id),
                    Arc::clone(ctx),
                    Arc::clone(ids),
                    Arc::clone(deferred),
                    Arc::clone(sink),
                    filter,
                ))
            },
        )?;

        let mut expected = self.config.first_sequence;
        for unit in source.units()? {
            if !ctx.should_continue() {
                break;
            }
            match unit {
                Ok(unit) => {
                    if unit.sequence != expected {
                        ctx.abort(
                            &PipelineError::Internal(format!(
                                "source produced sequence {} where {expected} was expected",
                                unit.sequence
                            )),
                            Some(&unit.describe()),
                        );
                        break;
                    }
                    expected += 1;
                    if pool.submit(unit).is_err() {
                        // Every worker stopped; the abort already says why.
                        break;
                    }
                }
                Err(e) if ctx.policy().is_fatal(&e) => {
                    ctx.abort(&e, None);
                    break;
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Skipping unreadable source record");
                    ctx.events().publish(Event::Counter {
                        kind: CounterKind::Failed,
                        delta: 1,
                    });
                }
            }
        }
        debug!(submitted = expected - self.config.first_sequence, "Primary input exhausted");
        pool.join()
    }

    fn run_secondary(
        &self,
        ctx: &Arc<RunContext>,
        ids: &Arc<IdCache>,
        deferred: &DeferredQueue,
    ) -> Result<(), PipelineError> {
        info!(references = deferred.pushed(), "Resolving deferred references");
        let pool = WorkerPool::spawn(
            "xlink",
            self.config.xlink_workers,
            self.config.queue_capacity,
            ctx,
            |id| {
                Ok(XlinkWorker::new(
                    id,
                    self.adapter.connect()?,
                    Arc::clone(ctx),
                    Arc::clone(ids),
                    Arc::clone(&self.resolvers),
                ))
            },
        )?;
        let handed = deferred.drain(|reference| {
            Ok(ctx.should_continue() && pool.submit(reference).is_ok())
        })?;
        debug!(handed, "Deferred queue drained");
        pool.join()
    }
}

/// Drops every cache table of the run, logging instead of failing.
fn cleanup(ids: &IdCache, deferred: &DeferredQueue, store: &CacheTableStore) {
    if let Err(e) = deferred.drop_table() {
        warn!(error = %format!("{e:#}"), "Failed to drop deferred reference table");
    }
    if let Err(e) = ids.drop_tables() {
        warn!(error = %format!("{e:#}"), "Failed to drop identifier cache tables");
    }
    match store.drop_all() {
        Ok(0) => {}
        Ok(n) => debug!(tables = n, "Dropped remaining cache tables"),
        Err(e) => warn!(error = %format!("{e:#}"), "Failed to drop remaining cache tables"),
    }
}
