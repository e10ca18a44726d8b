//! Concurrent email-classification engine.
//!
//! Tasks flow through a [`processing::ParallelBatchProcessor`], which runs each one
//! through a [`classification::TieredRouter`] on a worker pool and hands the
//! outcome to a [`persistence::BulkPersistenceManager`]. Deep verdicts are cached
//! in a [`cache::MultiLevelCache`], which a [`memory::MemoryPressureMonitor`] trims
//! when the process grows too large.

pub mod cache;
pub mod classification;
pub mod cli;
pub mod config;
pub mod infrastructure;
pub mod memory;
pub mod persistence;
pub mod processing;
pub mod simulation;

pub use infrastructure::error::EngineError;
