pub mod error;
pub mod logging;

pub use error::{
    CacheError, ClassifierError, EngineError, ErrorCategory, ErrorSeverity, PersistenceError,
    PersistenceResult, PoolError,
};
pub use logging::{setup_logging, BatchTracker, LogFormat, LogOutput, LoggingConfig};
