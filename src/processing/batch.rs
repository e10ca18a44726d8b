use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::manager::PoolManager;
use super::pool::{PoolStats, SubmitError, WorkFn};
use crate::classification::{
    ClassificationResult, ClassificationTask, DeepClassifier, FastClassifier, Tier, TierDetail, TieredRouter,
};
use crate::infrastructure::error::{panic_message, ClassifierError, PersistenceError, PoolError};
use crate::infrastructure::logging::BatchTracker;
use crate::memory::MemoryPressureMonitor;
use crate::persistence::{BulkPersistenceManager, PersistenceRecord, RecordKind};

/// 批处理配置
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// How long one submit attempt waits for queue space before retrying
    pub submit_timeout: Duration,
    /// Upper bound on waiting for every result of a batch
    pub completion_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub progress_every: usize,
    /// Tasks per chunk in streaming mode
    pub chunk_size: usize,
    /// Resident memory ceiling checked after each streamed chunk
    pub memory_ceiling_bytes: Option<u64>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            queue_capacity: 256,
            submit_timeout: Duration::from_millis(100),
            completion_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(10),
            progress_every: 10,
            chunk_size: 500,
            memory_ceiling_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub fraction: f64,
    pub completed: usize,
    pub total: usize,
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Everything produced by one batch
#[derive(Debug)]
pub struct BatchOutcome {
    /// In completion order
    pub results: Vec<ClassificationResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub escalated: usize,
    /// Tasks with no result when the completion timeout expired
    pub missing: usize,
    pub submit_retries: u64,
    pub persistence_errors: usize,
    pub records_dropped: usize,
    pub pool: PoolStats,
    pub flush_error: Option<PersistenceError>,
    pub elapsed: Duration,
}

/// Serializable digest of a batch or stream run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub escalated: usize,
    pub missing: usize,
    pub submit_retries: u64,
    pub persistence_errors: usize,
    pub records_dropped: usize,
    pub flush_error: Option<String>,
    pub elapsed_ms: u64,
}

impl BatchOutcome {
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            processed: self.results.len(),
            succeeded: self.succeeded,
            failed: self.failed,
            escalated: self.escalated,
            missing: self.missing,
            submit_retries: self.submit_retries,
            persistence_errors: self.persistence_errors,
            records_dropped: self.records_dropped,
            flush_error: self.flush_error.as_ref().map(ToString::to_string),
            elapsed_ms: self.elapsed.as_millis() as u64,
        }
    }
}

/// Handed to the chunk callback in streaming mode
#[derive(Debug)]
pub struct ChunkReport {
    pub index: usize,
    pub outcome: BatchOutcome,
    /// Bytes freed by a forced reclamation after this chunk
    pub reclaimed: Option<usize>,
}

/// Totals of a streaming run. Per-task results only go to the chunk callback.
#[derive(Debug)]
pub struct StreamOutcome {
    pub chunks: usize,
    pub summary: BatchSummary,
    pub cancelled: bool,
    pub forced_reclamations: usize,
    pub flush_error: Option<PersistenceError>,
}

#[derive(Default)]
struct PersistCounters {
    errors: AtomicUsize,
    dropped: AtomicUsize,
}

/// Fans tasks out over a fresh worker pool, classifies them and persists the results
pub struct ParallelBatchProcessor {
    config: ProcessorConfig,
    pools: Arc<PoolManager>,
    persistence: Arc<BulkPersistenceManager>,
    monitor: Option<Arc<MemoryPressureMonitor>>,
}

impl ParallelBatchProcessor {
    pub fn new(config: ProcessorConfig, pools: Arc<PoolManager>, persistence: Arc<BulkPersistenceManager>) -> Self {
        let config = ProcessorConfig {
            progress_every: config.progress_every.max(1),
            chunk_size: config.chunk_size.max(1),
            ..config
        };
        Self {
            config,
            pools,
            persistence,
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<MemoryPressureMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Classify and persist every task, then flush all buffered records
    pub async fn process_batch(
        &self,
        tasks: Vec<ClassificationTask>,
        router: Arc<TieredRouter>,
        fast: Arc<dyn FastClassifier>,
        deep: Option<Arc<dyn DeepClassifier>>,
        progress: Option<ProgressFn>,
    ) -> Result<BatchOutcome, PoolError> {
        let mut outcome = self.run(tasks, router, fast, deep, progress).await?;

        if let Err(e) = self.persistence.flush_all().await {
            error!(error = %e, "final flush failed, records remain buffered");
            outcome.flush_error = Some(e);
        }
        Ok(outcome)
    }

    /// Consume `stream` in chunks of `chunk_size` until it ends or `cancel` fires.
    ///
    /// A chunk that started always finishes. When `cancel` fires while a chunk is
    /// still being pulled, the tasks already taken from the stream are processed as
    /// a final short chunk. Buffered records are flushed before returning.
    pub async fn process_stream<S, F>(
        &self,
        stream: S,
        router: Arc<TieredRouter>,
        fast: Arc<dyn FastClassifier>,
        deep: Option<Arc<dyn DeepClassifier>>,
        cancel: CancellationToken,
        mut on_chunk: F,
    ) -> Result<StreamOutcome, PoolError>
    where
        S: Stream<Item = ClassificationTask> + Send,
        F: FnMut(ChunkReport) + Send,
    {
        let start = Instant::now();
        let chunk_size = self.config.chunk_size;
        let mut stream = Box::pin(stream);
        let mut summary = BatchSummary::default();
        let mut index = 0;
        let mut cancelled = false;
        let mut exhausted = false;
        let mut forced_reclamations = 0;

        while !cancelled && !exhausted {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let mut chunk = Vec::with_capacity(chunk_size);
            while chunk.len() < chunk_size {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    next = stream.next() => match next {
                        Some(task) => chunk.push(task),
                        None => {
                            exhausted = true;
                            break;
                        }
                    },
                }
            }
            if chunk.is_empty() {
                break;
            }

            debug!(chunk = index, size = chunk.len(), "processing chunk");
            let outcome = self
                .run(chunk, Arc::clone(&router), Arc::clone(&fast), deep.clone(), None)
                .await?;
            accumulate(&mut summary, &outcome);

            let reclaimed = match (&self.monitor, self.config.memory_ceiling_bytes) {
                (Some(monitor), Some(ceiling)) => monitor.check_ceiling(ceiling).await,
                _ => None,
            };
            if reclaimed.is_some() {
                forced_reclamations += 1;
            }

            on_chunk(ChunkReport {
                index,
                outcome,
                reclaimed,
            });
            index += 1;
        }

        if cancelled {
            info!(chunks = index, "stream processing cancelled");
        }

        let flush_error = match self.persistence.flush_all().await {
            Ok(_) => None,
            Err(e) => {
                error!(error = %e, "final flush failed, records remain buffered");
                summary.flush_error = Some(e.to_string());
                Some(e)
            }
        };
        summary.elapsed_ms = start.elapsed().as_millis() as u64;

        Ok(StreamOutcome {
            chunks: index,
            summary,
            cancelled,
            forced_reclamations,
            flush_error,
        })
    }

    async fn run(
        &self,
        tasks: Vec<ClassificationTask>,
        router: Arc<TieredRouter>,
        fast: Arc<dyn FastClassifier>,
        deep: Option<Arc<dyn DeepClassifier>>,
        progress: Option<ProgressFn>,
    ) -> Result<BatchOutcome, PoolError> {
        let start = Instant::now();
        let total = tasks.len();
        let tracker = BatchTracker::new("classify_batch", total);
        let pool_name = format!("batch-{}", tracker.operation_id());

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<ClassificationResult>();
        let persist_counters = Arc::new(PersistCounters::default());

        let work_fn = classify_and_persist(
            router,
            fast,
            deep,
            Arc::clone(&self.persistence),
            result_tx.clone(),
            Arc::clone(&persist_counters),
        );
        // A started batch finishes even when the caller's stream is cancelled
        let pool = self
            .pools
            .create_pool_with_token(
                &pool_name,
                self.config.worker_count,
                self.config.queue_capacity,
                work_fn,
                CancellationToken::new(),
            )
            .await?;

        let submit_retries = AtomicU64::new(0);
        let submit_all = async {
            for task in tasks {
                let mut task = task;
                loop {
                    match pool.try_submit(task, self.config.submit_timeout).await {
                        Ok(()) => break,
                        Err(SubmitError::Full(rejected)) => {
                            submit_retries.fetch_add(1, Ordering::Relaxed);
                            debug!(task_id = %rejected.id, "queue full, retrying submit");
                            task = rejected;
                        }
                        Err(SubmitError::Closed(rejected)) => {
                            warn!(task_id = %rejected.id, "pool stopped accepting, task not classified");
                            let result = ClassificationResult::error(
                                &rejected.id,
                                "worker pool is not accepting tasks",
                                Duration::ZERO,
                            );
                            for record in records_for(&rejected, &result) {
                                persist(&self.persistence, record, &persist_counters).await;
                            }
                            let _ = result_tx.send(result);
                            break;
                        }
                    }
                }
            }
        };

        let progress_every = self.config.progress_every;
        let deadline = tokio::time::Instant::now() + self.config.completion_timeout;
        let collect = async {
            let mut results = Vec::with_capacity(total);
            while results.len() < total {
                match tokio::time::timeout_at(deadline, result_rx.recv()).await {
                    Ok(Some(result)) => {
                        results.push(result);
                        let completed = results.len();
                        if completed % progress_every == 0 {
                            tracker.log_progress(completed, total);
                            if let Some(progress) = &progress {
                                progress(Progress {
                                    fraction: completed as f64 / total as f64,
                                    completed,
                                    total,
                                });
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(received = results.len(), total, "batch completion timed out");
                        break;
                    }
                }
            }
            results
        };

        let ((), results) = tokio::join!(submit_all, collect);

        if let Some(progress) = &progress {
            progress(Progress {
                fraction: 1.0,
                completed: results.len(),
                total,
            });
        }

        if let Err(e) = pool.shutdown(true, self.config.shutdown_timeout).await {
            warn!(error = %e, "batch pool did not stop cleanly");
        }
        self.pools.remove(&pool_name).await;

        let failed = results.iter().filter(|r| r.is_error()).count();
        let escalated = results.iter().filter(|r| r.tier() == Tier::Strategic).count();
        let succeeded = results.len() - failed;
        tracker.complete(succeeded, failed);

        Ok(BatchOutcome {
            missing: total - results.len(),
            results,
            succeeded,
            failed,
            escalated,
            submit_retries: submit_retries.load(Ordering::Relaxed),
            persistence_errors: persist_counters.errors.load(Ordering::Relaxed),
            records_dropped: persist_counters.dropped.load(Ordering::Relaxed),
            pool: pool.stats(),
            flush_error: None,
            elapsed: start.elapsed(),
        })
    }
}

fn accumulate(summary: &mut BatchSummary, outcome: &BatchOutcome) {
    summary.processed += outcome.results.len();
    summary.succeeded += outcome.succeeded;
    summary.failed += outcome.failed;
    summary.escalated += outcome.escalated;
    summary.missing += outcome.missing;
    summary.submit_retries += outcome.submit_retries;
    summary.persistence_errors += outcome.persistence_errors;
    summary.records_dropped += outcome.records_dropped;
}

fn classify_and_persist(
    router: Arc<TieredRouter>,
    fast: Arc<dyn FastClassifier>,
    deep: Option<Arc<dyn DeepClassifier>>,
    persistence: Arc<BulkPersistenceManager>,
    results: mpsc::UnboundedSender<ClassificationResult>,
    counters: Arc<PersistCounters>,
) -> WorkFn<ClassificationTask> {
    Arc::new(move |task: ClassificationTask| {
        let router = Arc::clone(&router);
        let fast = Arc::clone(&fast);
        let deep = deep.clone();
        let persistence = Arc::clone(&persistence);
        let results = results.clone();
        let counters = Arc::clone(&counters);

        async move {
            let start = Instant::now();
            let classified = AssertUnwindSafe(router.classify(&task, fast.as_ref(), deep.as_deref()))
                .catch_unwind()
                .await;

            let result = match classified {
                Ok(result) => result,
                Err(panic) => {
                    router.record_error();
                    let err = ClassifierError::Panicked {
                        message: panic_message(panic.as_ref()),
                    };
                    error!(task_id = %task.id, error = %err, "classifier panicked");
                    ClassificationResult::error(&task.id, err.to_string(), start.elapsed())
                }
            };

            for record in records_for(&task, &result) {
                persist(&persistence, record, &counters).await;
            }

            results
                .send(result)
                .map_err(|_| anyhow::anyhow!("result collector for task {} is gone", task.id))
        }
        .boxed()
    })
}

async fn persist(persistence: &BulkPersistenceManager, record: PersistenceRecord, counters: &PersistCounters) {
    match persistence.add(record).await {
        Ok(()) => {}
        Err(PersistenceError::BufferFull { kind, record, .. }) => {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            // make room once, then give up on this record
            let _ = persistence.flush(kind).await;
            if let Err(e) = persistence.add(*record).await {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                error!(%kind, error = %e, "persistence buffer still full, record dropped");
            }
        }
        Err(e) => {
            // the batch was re-queued by the manager
            counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "automatic flush failed");
        }
    }
}

/// Records written for one result: a classification or failure row, plus an
/// escalation row for strategic results
pub(crate) fn records_for(task: &ClassificationTask, result: &ClassificationResult) -> Vec<PersistenceRecord> {
    if let Some(error) = &result.error {
        return vec![PersistenceRecord::new(RecordKind::Failure)
            .with_field("task_id", task.id.clone())
            .with_field("sender", task.features.sender.clone())
            .with_field("error", error.clone())
            .with_field("duration_ms", result.duration.as_millis() as u64)];
    }

    let mut records = vec![PersistenceRecord::new(RecordKind::Classification)
        .with_field("task_id", task.id.clone())
        .with_field("sender", task.features.sender.clone())
        .with_field("domain", task.features.domain.clone())
        .with_field("category", result.category.clone())
        .with_field("confidence", result.confidence)
        .with_field("tier", result.tier().as_str())
        .with_field("reason", result.reason.clone())
        .with_field("duration_ms", result.duration.as_millis() as u64)];

    if let TierDetail::Strategic {
        fast_category,
        fast_confidence,
        deep_confidence,
        blended,
        cached,
    } = &result.detail
    {
        records.push(
            PersistenceRecord::new(RecordKind::Escalation)
                .with_field("task_id", task.id.clone())
                .with_field("fast_category", fast_category.clone())
                .with_field("fast_confidence", *fast_confidence)
                .with_field("deep_confidence", *deep_confidence)
                .with_field("final_category", result.category.clone())
                .with_field("blended", *blended)
                .with_field("cached", *cached),
        );
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::{DeepVerdict, EmailFeatures, FastVerdict, RouterConfig};
    use crate::persistence::{MemorySink, PersistenceConfig};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// "uncertain" subjects get low confidence, everything else is confidently ham
    struct SubjectFast;

    #[async_trait]
    impl FastClassifier for SubjectFast {
        async fn classify(&self, features: &EmailFeatures) -> Result<FastVerdict, ClassifierError> {
            if features.subject.contains("panic") {
                panic!("fast classifier bug");
            }
            if features.subject.contains("uncertain") {
                Ok(FastVerdict::new("newsletter", 0.4, "weak signal"))
            } else {
                Ok(FastVerdict::new("ham", 0.99, "known sender"))
            }
        }
    }

    #[derive(Default)]
    struct CountingDeep {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeepClassifier for CountingDeep {
        async fn analyze(&self, _features: &EmailFeatures) -> Result<DeepVerdict, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DeepVerdict::new("promotions", 0.9, "deep"))
        }
    }

    fn tasks(count: usize, uncertain: usize) -> Vec<ClassificationTask> {
        (0..count)
            .map(|i| {
                let subject = if i < uncertain { "uncertain offer" } else { "meeting notes" };
                ClassificationTask::with_id(
                    format!("t-{}", i),
                    EmailFeatures::new(format!("user{}@example.com", i), subject, "example.com"),
                )
            })
            .collect()
    }

    fn processor(batch_size: usize) -> (Arc<MemorySink>, Arc<BulkPersistenceManager>, ParallelBatchProcessor) {
        let sink = Arc::new(MemorySink::new());
        let persistence = Arc::new(BulkPersistenceManager::new(
            PersistenceConfig {
                batch_size,
                max_buffered: 10_000,
            },
            sink.clone(),
        ));
        let processor = ParallelBatchProcessor::new(
            ProcessorConfig {
                worker_count: 4,
                queue_capacity: 8,
                submit_timeout: Duration::from_millis(20),
                progress_every: 10,
                chunk_size: 25,
                ..Default::default()
            },
            Arc::new(PoolManager::new()),
            persistence.clone(),
        );
        (sink, persistence, processor)
    }

    #[tokio::test]
    async fn test_batch_classifies_persists_and_reports_progress() {
        let (sink, persistence, processor) = processor(16);
        let router = Arc::new(TieredRouter::new(RouterConfig::default()));
        let deep = Arc::new(CountingDeep::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |p: Progress| seen_cb.lock().unwrap().push(p));

        let outcome = processor
            .process_batch(
                tasks(100, 5),
                router.clone(),
                Arc::new(SubjectFast),
                Some(deep.clone() as Arc<dyn DeepClassifier>),
                Some(progress),
            )
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 100);
        assert_eq!(outcome.escalated, 5);
        assert_eq!(outcome.failed, 0);
        assert!(outcome.flush_error.is_none());
        assert_eq!(deep.calls.load(Ordering::SeqCst), 5);

        assert_eq!(sink.count(RecordKind::Classification).await, 100);
        assert_eq!(sink.count(RecordKind::Escalation).await, 5);
        assert_eq!(persistence.stats().await.total_buffered(), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 11);
        assert_eq!(seen.last().unwrap().fraction, 1.0);
        assert_eq!(seen[0].completed, 10);
        assert_eq!(outcome.pool.live_workers, 0);
    }

    #[tokio::test]
    async fn test_panicking_classifier_yields_error_results() {
        let (sink, _persistence, processor) = processor(100);
        let router = Arc::new(TieredRouter::new(RouterConfig::default()));
        let mut batch = tasks(10, 0);
        batch[3].features.subject = "panic now".to_string();

        let outcome = processor
            .process_batch(batch, router, Arc::new(SubjectFast), None, None)
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 10);
        assert_eq!(outcome.failed, 1);
        let failed = outcome.results.iter().find(|r| r.is_error()).unwrap();
        assert_eq!(failed.task_id, "t-3");
        assert_eq!(failed.category, "ERROR");
        assert_eq!(sink.count(RecordKind::Failure).await, 1);
        assert_eq!(sink.count(RecordKind::Classification).await, 9);
    }

    #[tokio::test]
    async fn test_flush_error_reported_in_outcome() {
        let (sink, persistence, processor) = processor(1000);
        let router = Arc::new(TieredRouter::new(RouterConfig::default()));
        sink.fail_next(1).await;

        let outcome = processor
            .process_batch(tasks(20, 0), router, Arc::new(SubjectFast), None, None)
            .await
            .unwrap();

        assert!(outcome.flush_error.is_some());
        assert_eq!(persistence.pending(RecordKind::Classification).await, 20);

        persistence.flush_all().await.unwrap();
        assert_eq!(sink.count(RecordKind::Classification).await, 20);
    }

    #[tokio::test]
    async fn test_stream_processes_in_chunks() {
        let (sink, _persistence, processor) = processor(50);
        let router = Arc::new(TieredRouter::new(RouterConfig::default()));
        let mut sizes = Vec::new();

        let outcome = processor
            .process_stream(
                futures_util::stream::iter(tasks(60, 0)),
                router,
                Arc::new(SubjectFast),
                None,
                CancellationToken::new(),
                |report| sizes.push(report.outcome.results.len()),
            )
            .await
            .unwrap();

        assert_eq!(sizes, vec![25, 25, 10]);
        assert_eq!(outcome.chunks, 3);
        assert!(!outcome.cancelled);
        assert_eq!(outcome.summary.processed, 60);
        assert_eq!(sink.count(RecordKind::Classification).await, 60);
    }

    #[tokio::test]
    async fn test_stream_cancellation_between_chunks() {
        let (sink, _persistence, processor) = processor(1000);
        let router = Arc::new(TieredRouter::new(RouterConfig::default()));
        let cancel = CancellationToken::new();
        let cancel_after_first = cancel.clone();

        let outcome = processor
            .process_stream(
                futures_util::stream::iter(tasks(100, 0)),
                router,
                Arc::new(SubjectFast),
                None,
                cancel,
                move |_report| cancel_after_first.cancel(),
            )
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.chunks, 1);
        assert_eq!(outcome.summary.processed, 25);
        // the finished chunk is flushed on stop
        assert_eq!(sink.count(RecordKind::Classification).await, 25);
    }

    struct SlowFast(Duration);

    #[async_trait]
    impl FastClassifier for SlowFast {
        async fn classify(&self, _features: &EmailFeatures) -> Result<FastVerdict, ClassifierError> {
            tokio::time::sleep(self.0).await;
            Ok(FastVerdict::new("ham", 0.99, "slow rules"))
        }
    }

    #[tokio::test]
    async fn test_root_cancellation_lets_running_chunk_finish() {
        let sink = Arc::new(MemorySink::new());
        let persistence = Arc::new(BulkPersistenceManager::new(PersistenceConfig::default(), sink.clone()));
        let pools = Arc::new(PoolManager::new());
        let processor = ParallelBatchProcessor::new(
            ProcessorConfig {
                worker_count: 1,
                queue_capacity: 4,
                submit_timeout: Duration::from_millis(10),
                chunk_size: 40,
                ..Default::default()
            },
            Arc::clone(&pools),
            persistence,
        );
        let router = Arc::new(TieredRouter::new(RouterConfig::default()));

        let root = pools.cancellation_token();
        let trigger = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            trigger.cancel();
        });

        let outcome = processor
            .process_stream(
                futures_util::stream::iter(tasks(100, 0)),
                router,
                Arc::new(SlowFast(Duration::from_millis(5))),
                None,
                root,
                |_| {},
            )
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.chunks, 1);
        assert_eq!(outcome.summary.processed, 40);
        assert_eq!(outcome.summary.failed, 0);
        assert_eq!(sink.count(RecordKind::Classification).await, 40);
        assert_eq!(sink.count(RecordKind::Failure).await, 0);
    }

    #[tokio::test]
    async fn test_cancel_while_pulling_processes_pulled_tasks() {
        let (sink, _persistence, processor) = processor(1000);
        let router = Arc::new(TieredRouter::new(RouterConfig::default()));
        let pulled = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&pulled);
        let slow_stream = futures_util::stream::iter(tasks(100, 0)).then(move |task| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                task
            }
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            trigger.cancel();
        });

        let outcome = processor
            .process_stream(slow_stream, router, Arc::new(SubjectFast), None, cancel, |_| {})
            .await
            .unwrap();

        let pulled = pulled.load(Ordering::SeqCst);
        assert!(outcome.cancelled);
        assert!(pulled > 0 && pulled < 25);
        assert_eq!(outcome.chunks, 1);
        assert_eq!(outcome.summary.processed, pulled);
        assert_eq!(sink.count(RecordKind::Classification).await, pulled);
    }

    #[tokio::test]
    async fn test_tasks_rejected_by_stopped_pool_are_persisted_as_failures() {
        let sink = Arc::new(MemorySink::new());
        let persistence = Arc::new(BulkPersistenceManager::new(PersistenceConfig::default(), sink.clone()));
        let pools = Arc::new(PoolManager::new());
        let processor = ParallelBatchProcessor::new(
            ProcessorConfig {
                worker_count: 1,
                queue_capacity: 4,
                submit_timeout: Duration::from_millis(10),
                ..Default::default()
            },
            Arc::clone(&pools),
            persistence,
        );
        let router = Arc::new(TieredRouter::new(RouterConfig::default()));

        let stopper = Arc::clone(&pools);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = stopper.shutdown_all(false, Duration::from_secs(1)).await;
        });

        let outcome = processor
            .process_batch(tasks(40, 0), router, Arc::new(SlowFast(Duration::from_millis(5))), None, None)
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 40);
        assert!(outcome.failed > 0);
        assert_eq!(sink.count(RecordKind::Failure).await, outcome.failed);
        assert_eq!(sink.count(RecordKind::Classification).await, 40 - outcome.failed);
    }

    #[test]
    fn test_records_for_strategic_result() {
        let task = ClassificationTask::with_id("t-9", EmailFeatures::new("a@b.c", "s", "b.c"));
        let result = ClassificationResult {
            task_id: "t-9".to_string(),
            category: "promotions".to_string(),
            confidence: 0.9,
            detail: TierDetail::Strategic {
                fast_category: "newsletter".to_string(),
                fast_confidence: 0.4,
                deep_confidence: 0.9,
                blended: false,
                cached: false,
            },
            reason: "deep".to_string(),
            duration: Duration::from_millis(5),
            error: None,
        };

        let records = records_for(&task, &result);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, RecordKind::Classification);
        assert_eq!(records[0].field("tier"), Some(&serde_json::json!("strategic")));
        assert_eq!(records[1].kind, RecordKind::Escalation);
        assert_eq!(records[1].field("fast_category"), Some(&serde_json::json!("newsletter")));
    }
}
