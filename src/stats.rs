use crate::events::{CounterKind, Event, EventBus, EventType, Subscription};
use crate::models::TypeTag;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Run-wide counters, fed from counter events on the bus.
#[derive(Default)]
pub struct PipelineStats {
    pub units_processed: AtomicU64,
    pub objects_written: AtomicU64,
    pub units_filtered: AtomicU64,
    pub units_failed: AtomicU64,
    pub references_deferred: AtomicU64,
    pub references_resolved: AtomicU64,
    pub references_skipped: AtomicU64,
    pub geometries: AtomicU64,
    pub objects_by_type: DashMap<TypeTag, u64>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: CounterKind, delta: u64) {
        self.counter(kind).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, kind: CounterKind) -> u64 {
        self.counter(kind).load(Ordering::Relaxed)
    }

    fn counter(&self, kind: CounterKind) -> &AtomicU64 {
        match kind {
            CounterKind::Units => &self.units_processed,
            CounterKind::Written => &self.objects_written,
            CounterKind::Filtered => &self.units_filtered,
            CounterKind::Failed => &self.units_failed,
            CounterKind::Deferred => &self.references_deferred,
            CounterKind::Resolved => &self.references_resolved,
            CounterKind::Skipped => &self.references_skipped,
            CounterKind::Geometries => &self.geometries,
        }
    }

    pub fn add_objects(&self, type_tag: TypeTag, count: u64) {
        *self.objects_by_type.entry(type_tag).or_insert(0) += count;
    }

    /// Subscribes these counters to the bus's counter and object events.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> [Subscription; 2] {
        let counters = Arc::clone(self);
        let objects = Arc::clone(self);
        [
            bus.subscribe(
                EventType::Counter,
                move |event| {
                    if let Event::Counter { kind, delta } = event {
                        counters.add(*kind, *delta);
                    }
                },
                false,
            ),
            bus.subscribe(
                EventType::ObjectCount,
                move |event| {
                    if let Event::ObjectCount { type_tag, count } = event {
                        objects.add_objects(*type_tag, *count);
                    }
                },
                false,
            ),
        ]
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut objects_by_type: Vec<(TypeTag, u64)> = self
            .objects_by_type
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        objects_by_type.sort_by_key(|(tag, _)| tag.code());
        StatsSnapshot {
            units_processed: self.get(CounterKind::Units),
            objects_written: self.get(CounterKind::Written),
            units_filtered: self.get(CounterKind::Filtered),
            units_failed: self.get(CounterKind::Failed),
            references_deferred: self.get(CounterKind::Deferred),
            references_resolved: self.get(CounterKind::Resolved),
            references_skipped: self.get(CounterKind::Skipped),
            geometries: self.get(CounterKind::Geometries),
            objects_by_type,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub units_processed: u64,
    pub objects_written: u64,
    pub units_filtered: u64,
    pub units_failed: u64,
    pub references_deferred: u64,
    pub references_resolved: u64,
    pub references_skipped: u64,
    pub geometries: u64,
    pub objects_by_type: Vec<(TypeTag, u64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Completed,
    Aborted { cause: String },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
    /// Buffered results discarded by the sink because of a sequence gap
    pub discarded: usize,
    /// Identifier cache entries that overflowed to cache tables
    pub ids_drained: u64,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_zero() {
        let stats = PipelineStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn add_routes_to_the_right_counter() {
        let stats = PipelineStats::new();
        stats.add(CounterKind::Units, 3);
        stats.add(CounterKind::Units, 2);
        stats.add(CounterKind::Skipped, 1);
        stats.add(CounterKind::Geometries, 40);

        let snap = stats.snapshot();
        assert_eq!(snap.units_processed, 5);
        assert_eq!(snap.references_skipped, 1);
        assert_eq!(snap.geometries, 40);
        assert_eq!(snap.objects_written, 0);
    }

    #[test]
    fn object_counts_sorted_by_type_code() {
        let stats = PipelineStats::new();
        stats.add_objects(TypeTag::Building, 2);
        stats.add_objects(TypeTag::Vegetation, 1);
        stats.add_objects(TypeTag::Building, 3);

        assert_eq!(
            stats.snapshot().objects_by_type,
            vec![(TypeTag::Vegetation, 1), (TypeTag::Building, 5)]
        );
    }

    #[test]
    fn attached_stats_follow_bus_events() {
        let bus = EventBus::new(8);
        let stats = Arc::new(PipelineStats::new());
        let _subs = stats.attach(&bus);

        bus.publish(Event::Counter {
            kind: CounterKind::Written,
            delta: 7,
        });
        bus.publish(Event::ObjectCount {
            type_tag: TypeTag::Road,
            count: 4,
        });
        bus.shutdown();

        let snap = stats.snapshot();
        assert_eq!(snap.objects_written, 7);
        assert_eq!(snap.objects_by_type, vec![(TypeTag::Road, 4)]);
    }
}
