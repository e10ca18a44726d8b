pub mod batch;
pub mod manager;
pub mod pool;

pub use batch::{
    BatchOutcome, BatchSummary, ChunkReport, ParallelBatchProcessor, ProcessorConfig, Progress, ProgressFn,
    StreamOutcome,
};
pub use manager::{ManagedPool, PoolManager};
pub use pool::{PoolStats, SubmitError, WorkFn, WorkerPool};
