use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persistence::models::{PersistenceRecord, RecordKind};

/// 缓存错误
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("cache serialization failed in namespace '{namespace}': {message}")]
    Serialization { namespace: String, message: String },

    #[error("cache compression failed in namespace '{namespace}': {message}")]
    Compression { namespace: String, message: String },
}

/// 分类器错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("{classifier} classifier failed: {message}")]
    Failed { classifier: String, message: String },

    #[error("{classifier} classifier timed out after {timeout_ms}ms")]
    Timeout { classifier: String, timeout_ms: u64 },

    #[error("classification panicked: {message}")]
    Panicked { message: String },
}

impl ClassifierError {
    pub fn failed(classifier: impl Into<String>, message: impl Into<String>) -> Self {
        ClassifierError::Failed {
            classifier: classifier.into(),
            message: message.into(),
        }
    }

    pub fn timeout(classifier: impl Into<String>, timeout_ms: u64) -> Self {
        ClassifierError::Timeout {
            classifier: classifier.into(),
            timeout_ms,
        }
    }
}

/// 持久化错误
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The sink rejected the whole batch; the records were re-queued.
    #[error("transient persistence failure for {kind} ({records} records re-queued): {message}")]
    Transient {
        kind: RecordKind,
        records: usize,
        message: String,
    },

    /// The live buffer for this kind is at capacity. The record is handed back.
    #[error("persistence buffer for {kind} is full ({capacity} records)")]
    BufferFull {
        kind: RecordKind,
        capacity: usize,
        record: Box<PersistenceRecord>,
    },

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "storage-sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PersistenceError {
    pub fn transient(kind: RecordKind, records: usize, message: impl Into<String>) -> Self {
        PersistenceError::Transient {
            kind,
            records,
            message: message.into(),
        }
    }

    /// Whether a later flush cycle can be expected to succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            PersistenceError::Transient { .. } => true,
            PersistenceError::BufferFull { .. } => true,
            PersistenceError::Serialization(_) => false,
            #[cfg(feature = "storage-sqlite")]
            PersistenceError::Database(_) => true,
        }
    }
}

/// 线程池错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("a pool named '{0}' is already registered")]
    DuplicateName(String),

    #[error("pool '{pool}' force-stopped workers {workers:?} after shutdown timeout")]
    ShutdownTimeout { pool: String, workers: Vec<usize> },
}

/// 引擎统一错误类型
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Configuration {
            message: message.into(),
        }
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EngineError::Configuration { .. } => ErrorSeverity::Critical,
            EngineError::Persistence(e) if e.is_retryable() => ErrorSeverity::High,
            EngineError::Persistence(_) => ErrorSeverity::Critical,
            EngineError::Pool(PoolError::ShutdownTimeout { .. }) => ErrorSeverity::Medium,
            EngineError::Pool(_) => ErrorSeverity::High,
            EngineError::Classifier(_) => ErrorSeverity::Low,
            EngineError::Cache(_) => ErrorSeverity::Low,
        }
    }

    /// 获取错误类别
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Configuration { .. } => ErrorCategory::Configuration,
            EngineError::Cache(_) => ErrorCategory::Infrastructure,
            EngineError::Classifier(_) => ErrorCategory::ExternalService,
            EngineError::Persistence(_) => ErrorCategory::Storage,
            EngineError::Pool(_) => ErrorCategory::Scheduling,
        }
    }
}

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Configuration,
    Infrastructure,
    ExternalService,
    Storage,
    Scheduling,
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_error_retryable() {
        let err = PersistenceError::transient(RecordKind::Classification, 3, "disk full");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("3 records re-queued"));

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = PersistenceError::from(json_err);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_engine_error_classification() {
        let err = EngineError::from(ClassifierError::timeout("deep", 250));
        assert_eq!(err.severity(), ErrorSeverity::Low);
        assert_eq!(err.category(), ErrorCategory::ExternalService);
        assert_eq!(err.to_string(), "deep classifier timed out after 250ms");

        let err = EngineError::from(PoolError::ShutdownTimeout {
            pool: "batch".to_string(),
            workers: vec![2],
        });
        assert_eq!(err.severity(), ErrorSeverity::Medium);
        assert_eq!(err.category(), ErrorCategory::Scheduling);

        let err = EngineError::config("workers must be > 0");
        assert_eq!(err.severity(), ErrorSeverity::Critical);
    }
}
