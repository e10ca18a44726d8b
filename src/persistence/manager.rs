use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::models::{PersistenceRecord, PersistenceStats, RecordKind};
use super::sink::PersistenceSink;
use crate::infrastructure::error::{PersistenceError, PersistenceResult};

/// 批量持久化配置
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Buffer length that triggers an automatic flush from `add`
    pub batch_size: usize,
    /// Live buffer bound per kind; re-queued records may exceed it
    pub max_buffered: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_buffered: 10_000,
        }
    }
}

#[derive(Debug, Default)]
struct BufferState {
    queues: HashMap<RecordKind, VecDeque<PersistenceRecord>>,
    stats: PersistenceStats,
}

/// Buffers records per kind and writes them to the sink in bulk.
///
/// A failed write never drops records: the batch goes back to the front of
/// its buffer in enqueue order and the error is surfaced to the caller.
pub struct BulkPersistenceManager {
    config: PersistenceConfig,
    sink: Arc<dyn PersistenceSink>,
    state: Mutex<BufferState>,
    // serializes sink writes per kind so batches land in enqueue order
    flush_locks: HashMap<RecordKind, Mutex<()>>,
}

impl BulkPersistenceManager {
    pub fn new(config: PersistenceConfig, sink: Arc<dyn PersistenceSink>) -> Self {
        let config = PersistenceConfig {
            batch_size: config.batch_size.max(1),
            max_buffered: config.max_buffered.max(config.batch_size.max(1)),
        };
        let flush_locks = RecordKind::ALL
            .iter()
            .map(|kind| (*kind, Mutex::new(())))
            .collect();

        Self {
            config,
            sink,
            state: Mutex::new(BufferState::default()),
            flush_locks,
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Buffer a record, flushing its kind when the batch threshold is reached.
    ///
    /// `BufferFull` hands the record back untouched. An error from the
    /// automatic flush is returned after its batch has been re-queued.
    pub async fn add(&self, record: PersistenceRecord) -> PersistenceResult<()> {
        let kind = record.kind;
        let should_flush = {
            let mut state = self.state.lock().await;
            let queue = state.queues.entry(kind).or_default();

            if queue.len() >= self.config.max_buffered {
                state.stats.records_rejected += 1;
                return Err(PersistenceError::BufferFull {
                    kind,
                    capacity: self.config.max_buffered,
                    record: Box::new(record),
                });
            }

            queue.push_back(record);
            let len = queue.len();
            state.stats.records_added += 1;
            len >= self.config.batch_size
        };

        if should_flush {
            debug!(%kind, "batch threshold reached, flushing");
            self.flush(kind).await?;
        }
        Ok(())
    }

    /// Write every buffered record of `kind` in one sink call. Returns the number written.
    pub async fn flush(&self, kind: RecordKind) -> PersistenceResult<usize> {
        let _guard = match self.flush_locks.get(&kind) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let batch: Vec<PersistenceRecord> = {
            let mut state = self.state.lock().await;
            match state.queues.get_mut(&kind) {
                Some(queue) if !queue.is_empty() => std::mem::take(queue).into(),
                _ => return Ok(0),
            }
        };
        let count = batch.len();

        match self.sink.write_batch(kind, &batch).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.stats.records_flushed += count as u64;
                state.stats.flushes += 1;
                state.stats.last_flush = Some(Utc::now());
                debug!(%kind, count, sink = self.sink.name(), "flushed batch");
                Ok(count)
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                let queue = state.queues.entry(kind).or_default();
                for record in batch.into_iter().rev() {
                    queue.push_front(record);
                }
                state.stats.records_requeued += count as u64;
                state.stats.failed_flushes += 1;
                warn!(%kind, count, error = %e, "flush failed, records re-queued");
                Err(e)
            }
        }
    }

    /// Flush every kind. All kinds are attempted; the first error is returned.
    pub async fn flush_all(&self) -> PersistenceResult<usize> {
        let mut total = 0;
        let mut first_error = None;

        for kind in RecordKind::ALL {
            match self.flush(kind).await {
                Ok(count) => total += count,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    pub async fn pending(&self, kind: RecordKind) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(&kind)
            .map_or(0, VecDeque::len)
    }

    pub async fn stats(&self) -> PersistenceStats {
        let state = self.state.lock().await;
        let mut stats = state.stats.clone();
        stats.buffered = state
            .queues
            .iter()
            .map(|(kind, queue)| (*kind, queue.len()))
            .collect();
        stats
    }

    /// Periodic `flush_all` until `cancel` fires, then one final flush
    pub fn start_auto_flush(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        match manager.flush_all().await {
                            Ok(count) => info!(count, "final flush complete"),
                            Err(e) => error!(error = %e, "final flush failed"),
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = manager.flush_all().await {
                            warn!(error = %e, "periodic flush failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::sink::MemorySink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    fn record(kind: RecordKind, seq: usize) -> PersistenceRecord {
        PersistenceRecord::new(kind).with_field("seq", seq)
    }

    fn seqs(records: &[PersistenceRecord]) -> Vec<u64> {
        records
            .iter()
            .filter_map(|r| r.field("seq").and_then(|v| v.as_u64()))
            .collect()
    }

    fn manager(batch_size: usize, max_buffered: usize) -> (Arc<MemorySink>, BulkPersistenceManager) {
        let sink = Arc::new(MemorySink::new());
        let manager = BulkPersistenceManager::new(
            PersistenceConfig {
                batch_size,
                max_buffered,
            },
            sink.clone(),
        );
        (sink, manager)
    }

    #[tokio::test]
    async fn test_threshold_triggers_single_flush() {
        let (sink, manager) = manager(3, 100);

        for i in 0..3 {
            manager.add(record(RecordKind::Classification, i)).await.unwrap();
        }
        assert_eq!(sink.batches().await, 1);
        assert_eq!(sink.count(RecordKind::Classification).await, 3);
        assert_eq!(manager.pending(RecordKind::Classification).await, 0);

        manager.add(record(RecordKind::Classification, 3)).await.unwrap();
        assert_eq!(sink.batches().await, 1);
        assert_eq!(manager.pending(RecordKind::Classification).await, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_then_succeeds() {
        let (sink, manager) = manager(100, 1000);
        for i in 0..5 {
            manager.add(record(RecordKind::Failure, i)).await.unwrap();
        }

        sink.fail_next(1).await;
        let err = manager.flush_all().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(manager.pending(RecordKind::Failure).await, 5);

        assert_eq!(manager.flush_all().await.unwrap(), 5);
        assert_eq!(seqs(&sink.records(RecordKind::Failure).await), vec![0, 1, 2, 3, 4]);

        let stats = manager.stats().await;
        assert_eq!(stats.records_requeued, 5);
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.records_flushed, 5);
        assert_eq!(stats.total_buffered(), 0);
    }

    #[tokio::test]
    async fn test_requeued_records_stay_ahead_of_new_ones() {
        let (sink, manager) = manager(100, 1000);
        for i in 0..3 {
            manager.add(record(RecordKind::Classification, i)).await.unwrap();
        }

        sink.fail_next(1).await;
        assert!(manager.flush(RecordKind::Classification).await.is_err());

        manager.add(record(RecordKind::Classification, 3)).await.unwrap();
        manager.flush(RecordKind::Classification).await.unwrap();

        assert_eq!(
            seqs(&sink.records(RecordKind::Classification).await),
            vec![0, 1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_auto_flush_error_returned_from_add() {
        let (sink, manager) = manager(2, 1000);
        sink.fail_next(1).await;

        manager.add(record(RecordKind::Escalation, 0)).await.unwrap();
        let err = manager.add(record(RecordKind::Escalation, 1)).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Transient { records: 2, .. }));
        assert_eq!(manager.pending(RecordKind::Escalation).await, 2);
    }

    #[tokio::test]
    async fn test_buffer_full_hands_record_back() {
        let (sink, manager) = manager(2, 2);
        sink.fail_next(10).await;

        manager.add(record(RecordKind::Classification, 0)).await.unwrap();
        // auto flush fails and re-queues both records
        assert!(manager.add(record(RecordKind::Classification, 1)).await.is_err());

        match manager.add(record(RecordKind::Classification, 2)).await {
            Err(PersistenceError::BufferFull { capacity, record, .. }) => {
                assert_eq!(capacity, 2);
                assert_eq!(record.field("seq").and_then(|v| v.as_u64()), Some(2));
            }
            other => panic!("expected BufferFull, got {:?}", other),
        }
        assert_eq!(manager.stats().await.records_rejected, 1);
    }

    #[tokio::test]
    async fn test_flush_all_attempts_every_kind() {
        let (sink, manager) = manager(100, 1000);
        manager.add(record(RecordKind::Classification, 0)).await.unwrap();
        manager.add(record(RecordKind::Failure, 1)).await.unwrap();
        manager.add(record(RecordKind::Escalation, 2)).await.unwrap();

        // Classification is flushed first and fails
        sink.fail_next(1).await;
        assert!(manager.flush_all().await.is_err());

        assert_eq!(sink.count(RecordKind::Failure).await, 1);
        assert_eq!(sink.count(RecordKind::Escalation).await, 1);
        assert_eq!(manager.pending(RecordKind::Classification).await, 1);
    }

    /// Holds its first write open until released
    #[derive(Default)]
    struct GatedSink {
        gate_first: AtomicBool,
        entered: Notify,
        release: Notify,
        batches: StdMutex<Vec<Vec<u64>>>,
    }

    #[async_trait]
    impl PersistenceSink for GatedSink {
        fn name(&self) -> &str {
            "gated"
        }

        async fn write_batch(&self, _kind: RecordKind, records: &[PersistenceRecord]) -> PersistenceResult<()> {
            if self.gate_first.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.batches.lock().unwrap().push(seqs(records));
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_adds_during_flush_land_in_next_batch() {
        let sink = Arc::new(GatedSink::default());
        sink.gate_first.store(true, Ordering::SeqCst);
        let manager = Arc::new(BulkPersistenceManager::new(
            PersistenceConfig {
                batch_size: 100,
                max_buffered: 1000,
            },
            sink.clone(),
        ));

        for i in 0..5 {
            manager.add(record(RecordKind::Classification, i)).await.unwrap();
        }

        let flusher = manager.clone();
        let in_flight = tokio::spawn(async move { flusher.flush(RecordKind::Classification).await });
        sink.entered.notified().await;

        let adders: Vec<_> = (5..10)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.add(record(RecordKind::Classification, i)).await })
            })
            .collect();
        for adder in adders {
            adder.await.unwrap().unwrap();
        }
        assert_eq!(manager.pending(RecordKind::Classification).await, 5);

        sink.release.notify_one();
        assert_eq!(in_flight.await.unwrap().unwrap(), 5);
        assert_eq!(manager.flush(RecordKind::Classification).await.unwrap(), 5);

        let mut batches = sink.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![0, 1, 2, 3, 4]);
        batches[1].sort_unstable();
        assert_eq!(batches[1], vec![5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_auto_flush_task_flushes_on_cancel() {
        let (sink, manager) = manager(100, 1000);
        let manager = Arc::new(manager);
        let cancel = CancellationToken::new();
        let handle = manager.start_auto_flush(Duration::from_secs(3600), cancel.clone());

        manager.add(record(RecordKind::Classification, 0)).await.unwrap();
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(sink.count(RecordKind::Classification).await, 1);
    }
}
