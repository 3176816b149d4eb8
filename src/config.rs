use crate::error::{ErrorClass, PipelineError};
use crate::tiling::TilingConfig;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Publish per-worker counters every N processed units
pub const COUNTER_INTERVAL: u64 = 20;

/// Bounded capacity of each worker pool's input queue
pub const QUEUE_CAPACITY: usize = 1000;

/// Bounded capacity of the event bus dispatch queue
pub const EVENT_QUEUE_CAPACITY: usize = 10_000;

/// Number of identifier cache partitions (one backing table and lock each)
pub const CACHE_PARTITIONS: usize = 8;

/// In-memory identifier cache size that triggers a drain to cache tables
pub const DRAIN_THRESHOLD: usize = 200_000;

/// Entries persisted per automatic drain
pub const DRAIN_BATCH: usize = 100_000;

/// Rows a partition table holds before it branches into a sibling table
pub const MAX_ROWS_PER_TABLE: usize = 1_000_000;

/// Deferred references buffered in memory before spilling to a cache table
pub const DEFERRED_SPILL_THRESHOLD: usize = 50_000;

/// Rows per transaction for batched inserts
pub const MAX_BATCH_SIZE: usize = 10_000;

/// How long SQLite waits on a locked database before reporting busy
pub const BUSY_TIMEOUT_MS: u64 = 60_000;

/// Error classes that abort a run unless the configuration says otherwise
pub const DEFAULT_ABORT_CLASSES: &[ErrorClass] = &[
    ErrorClass::ConnectionLost,
    ErrorClass::Output,
    ErrorClass::Internal,
];

/// Settings for a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub xlink_workers: usize,
    pub queue_capacity: usize,
    pub counter_interval: u64,
    pub partitions: usize,
    pub drain_threshold: usize,
    pub drain_batch: usize,
    pub max_rows_per_table: usize,
    pub deferred_spill_threshold: usize,
    pub event_queue_capacity: usize,
    pub first_sequence: u64,
    pub max_batch_size: usize,
    pub busy_timeout_ms: u64,
    pub abort_on: Vec<ErrorClass>,
    pub tiling: Option<TilingConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            workers: cpus,
            xlink_workers: cpus.div_ceil(2),
            queue_capacity: QUEUE_CAPACITY,
            counter_interval: COUNTER_INTERVAL,
            partitions: CACHE_PARTITIONS,
            drain_threshold: DRAIN_THRESHOLD,
            drain_batch: DRAIN_BATCH,
            max_rows_per_table: MAX_ROWS_PER_TABLE,
            deferred_spill_threshold: DEFERRED_SPILL_THRESHOLD,
            event_queue_capacity: EVENT_QUEUE_CAPACITY,
            first_sequence: 0,
            max_batch_size: MAX_BATCH_SIZE,
            busy_timeout_ms: BUSY_TIMEOUT_MS,
            abort_on: DEFAULT_ABORT_CLASSES.to_vec(),
            tiling: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|e| {
            PipelineError::Config(format!("cannot open {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            PipelineError::Config(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let positive = [
            ("workers", self.workers),
            ("xlink_workers", self.xlink_workers),
            ("queue_capacity", self.queue_capacity),
            ("partitions", self.partitions),
            ("drain_batch", self.drain_batch),
            ("max_rows_per_table", self.max_rows_per_table),
            ("deferred_spill_threshold", self.deferred_spill_threshold),
            ("event_queue_capacity", self.event_queue_capacity),
            ("max_batch_size", self.max_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(PipelineError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.counter_interval == 0 {
            return Err(PipelineError::Config(
                "counter_interval must be at least 1".to_string(),
            ));
        }
        if let Some(tiling) = &self.tiling {
            tiling.validate()?;
        }
        Ok(())
    }
}
