#![cfg(feature = "storage-sqlite")]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mail_classifier::classification::{DeepClassifier, RouterConfig, TieredRouter};
use mail_classifier::persistence::{BulkPersistenceManager, PersistenceConfig, RecordKind, SqliteSink};
use mail_classifier::processing::{ParallelBatchProcessor, PoolManager, ProcessorConfig};
use mail_classifier::simulation::{KeywordClassifier, SimulatedDeepClassifier, WorkloadGenerator};
use tempfile::TempDir;

// Test a full simulated run against a SQLite file on disk
#[tokio::test]
async fn test_simulated_run_persists_to_sqlite() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let url = format!("sqlite://{}", dir.path().join("verdicts.db").display());

    let sink = Arc::new(SqliteSink::connect(&url, 2).await?);
    let persistence = Arc::new(BulkPersistenceManager::new(
        PersistenceConfig {
            batch_size: 50,
            max_buffered: 10_000,
        },
        sink.clone(),
    ));
    let processor = ParallelBatchProcessor::new(
        ProcessorConfig {
            worker_count: 4,
            queue_capacity: 32,
            ..Default::default()
        },
        Arc::new(PoolManager::new()),
        persistence.clone(),
    );

    let tasks = WorkloadGenerator::new(Some(42), 0.2, 0.1).generate(300);
    let router = Arc::new(TieredRouter::new(RouterConfig::default()));
    let deep: Arc<dyn DeepClassifier> = Arc::new(SimulatedDeepClassifier::new(Duration::from_millis(1)));

    let outcome = processor
        .process_batch(tasks, router, Arc::new(KeywordClassifier), Some(deep), None)
        .await?;
    assert!(outcome.flush_error.is_none());
    assert_eq!(outcome.failed, 0);

    assert_eq!(sink.count(RecordKind::Classification).await?, 300);
    assert_eq!(sink.count(RecordKind::Escalation).await? as usize, outcome.escalated);
    assert_eq!(sink.count(RecordKind::Failure).await?, 0);
    assert_eq!(persistence.pending(RecordKind::Classification).await, 0);

    let ids: HashSet<String> = sink
        .payloads(RecordKind::Classification)
        .await?
        .iter()
        .filter_map(|payload| payload["task_id"].as_str().map(str::to_string))
        .collect();
    assert_eq!(ids.len(), 300);

    // reopening finds the same rows
    drop(processor);
    let reopened = SqliteSink::connect(&url, 1).await?;
    assert_eq!(reopened.count(RecordKind::Classification).await?, 300);
    Ok(())
}
