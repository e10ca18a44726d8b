pub mod manager;
pub mod models;
pub mod sink;

pub use manager::{BulkPersistenceManager, PersistenceConfig};
pub use models::{PersistenceRecord, PersistenceStats, RecordKind};
#[cfg(feature = "storage-sqlite")]
pub use sink::SqliteSink;
pub use sink::{MemorySink, PersistenceSink};
