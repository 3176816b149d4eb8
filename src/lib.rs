//! Citypipe: concurrent import/export pipeline for 3D city models
//!
//! This crate moves large, heavily cross-referenced city object datasets
//! between a JSON-lines file representation and a SQLite database, in both
//! directions:
//!
//! 1. **Primary Pass** -- A bounded queue feeds a pool of workers; each one
//!    transforms units on its own database connection, consults the identifier
//!    cache, and defers references it cannot satisfy yet
//! 2. **Ordered Output** -- Results are released to the output writer strictly
//!    in input sequence order, whatever order workers finish in
//! 3. **Xlink Pass** -- A second pool drains the deferred queue and resolves
//!    each reference by kind (external assets, shared appearances, parents)
//!
//! # Architecture
//!
//! - **Partitioned identifier cache** -- Hash-partitioned, one lock and one
//!   overflow table per partition; requested entries are never evicted
//! - **Ephemeral cache tables** -- Created on first demand, branched when
//!   full, dropped at run end even on abort
//! - **Event bus** -- One dispatcher thread delivers counters and progress;
//!   aborts are delivered synchronously to every subscriber
//! - **Abort policy** -- Error classes decide between "count and continue"
//!   and stopping the run, with the contiguous output prefix preserved
//!
//! # Key Modules
//!
//! - [`pipeline`] -- Run orchestration and the [`pipeline::WorkSource`] seam
//! - [`worker`] -- Primary and xlink worker bodies, [`worker::UnitTransformer`]
//! - [`pool`] -- Fixed-size worker pool over a bounded channel
//! - [`id_cache`] -- Partitioned external-id to row-id cache
//! - [`cache_table`] -- Ephemeral overflow tables
//! - [`xlink`] -- Deferred-reference queue and resolvers
//! - [`sink`] -- Sequence-ordered output stage
//! - [`events`] -- Event bus and subscriptions
//! - [`tiling`] -- Spatial tile filter
//! - [`db`] -- Database adapter and SQLite implementation
//! - [`records`] -- JSON-lines import/export collaborators
//! - [`stats`] -- Atomic run counters and the run report
//! - [`config`] -- Defaults and the run configuration
//!
//! # Example Usage
//!
//! ```bash
//! # Import a JSON-lines file with 8 workers
//! citypipe import -i city.jsonl -d city.db --workers 8
//!
//! # Export all buildings back to JSON lines
//! citypipe export -d city.db -o buildings.jsonl --type Building
//! ```

pub mod cache_table;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod events;
pub mod id_cache;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod records;
pub mod schema;
pub mod sink;
pub mod stats;
pub mod tiling;
pub mod worker;
pub mod xlink;
