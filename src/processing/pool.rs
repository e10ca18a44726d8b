use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::infrastructure::error::{panic_message, PoolError};

const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(10);
const ABORT_GRACE: Duration = Duration::from_millis(100);

/// Work executed for every task. An `Err` or a panic is counted as a failure;
/// the worker keeps running either way.
pub type WorkFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

enum WorkerMessage<T> {
    Task(T),
    Stop,
}

/// Why a task was not accepted. The task is handed back.
#[derive(Debug)]
pub enum SubmitError<T> {
    /// Queue stayed full for the whole timeout
    Full(T),
    /// Pool is shut down or its token was cancelled
    Closed(T),
}

impl<T> SubmitError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SubmitError::Full(task) | SubmitError::Closed(task) => task,
        }
    }
}

/// 线程池统计信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub queued: usize,
    pub queue_capacity: usize,
    pub live_workers: usize,
    pub worker_errors: Vec<u64>,
    pub accepting: bool,
}

struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    live_workers: AtomicUsize,
    worker_errors: Vec<AtomicU64>,
}

impl PoolCounters {
    fn new(worker_count: usize) -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            live_workers: AtomicUsize::new(0),
            worker_errors: (0..worker_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn settled(&self) -> u64 {
        self.completed.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst)
    }
}

/// Decrements the live worker count however the worker task ends, abort included
struct LiveWorker(Arc<PoolCounters>);

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.live_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

struct WorkerHandle {
    id: usize,
    handle: JoinHandle<()>,
}

/// Fixed set of tokio workers draining one bounded queue
pub struct WorkerPool<T> {
    name: String,
    queue_capacity: usize,
    sender: mpsc::Sender<WorkerMessage<T>>,
    workers: Mutex<Vec<WorkerHandle>>,
    counters: Arc<PoolCounters>,
    accepting: AtomicBool,
    /// Held shared while a task is enqueued, exclusively while intake closes,
    /// so no task can land behind the stop messages
    intake: RwLock<()>,
    cancel: CancellationToken,
}

impl<T> std::fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `worker_count` workers on the current runtime
    pub fn new(
        name: impl Into<String>,
        worker_count: usize,
        queue_capacity: usize,
        work_fn: WorkFn<T>,
        cancel: CancellationToken,
    ) -> Self {
        let name = name.into();
        let worker_count = worker_count.max(1);
        let queue_capacity = queue_capacity.max(1);

        let (sender, receiver) = mpsc::channel(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(PoolCounters::new(worker_count));

        let workers = (0..worker_count)
            .map(|id| {
                counters.live_workers.fetch_add(1, Ordering::SeqCst);
                let live = LiveWorker(Arc::clone(&counters));
                let receiver = Arc::clone(&receiver);
                let work_fn = Arc::clone(&work_fn);
                let pool_name = name.clone();

                let handle = tokio::spawn(async move {
                    Self::worker_loop(id, pool_name, receiver, work_fn, live).await;
                });
                WorkerHandle { id, handle }
            })
            .collect();

        info!(pool = %name, worker_count, queue_capacity, "worker pool started");

        Self {
            name,
            queue_capacity,
            sender,
            workers: Mutex::new(workers),
            counters,
            accepting: AtomicBool::new(true),
            intake: RwLock::new(()),
            cancel,
        }
    }

    async fn worker_loop(
        worker_id: usize,
        pool: String,
        receiver: Arc<Mutex<mpsc::Receiver<WorkerMessage<T>>>>,
        work_fn: WorkFn<T>,
        live: LiveWorker,
    ) {
        debug!(%pool, worker_id, "worker started");
        let counters = Arc::clone(&live.0);

        loop {
            let message = {
                let mut receiver_guard = receiver.lock().await;
                receiver_guard.recv().await
            };

            let task = match message {
                Some(WorkerMessage::Task(task)) => task,
                Some(WorkerMessage::Stop) | None => break,
            };

            let outcome = AssertUnwindSafe(async { work_fn(task).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {
                    counters.completed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Err(e)) => {
                    counters.worker_errors[worker_id].fetch_add(1, Ordering::SeqCst);
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    warn!(%pool, worker_id, error = %e, "task failed");
                }
                Err(panic) => {
                    counters.worker_errors[worker_id].fetch_add(1, Ordering::SeqCst);
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    error!(%pool, worker_id, panic = %panic_message(panic.as_ref()), "task panicked");
                }
            }
        }

        debug!(%pool, worker_id, "worker stopped");
        drop(live);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Enqueue a task, waiting up to `timeout` for queue space
    pub async fn submit(&self, task: T, timeout: Duration) -> bool {
        self.try_submit(task, timeout).await.is_ok()
    }

    /// Like `submit`, but hands the task back when it is not accepted
    pub async fn try_submit(&self, task: T, timeout: Duration) -> Result<(), SubmitError<T>> {
        let _intake = self.intake.read().await;
        if !self.is_accepting() {
            return Err(SubmitError::Closed(task));
        }

        let permit = match tokio::time::timeout(timeout, self.sender.reserve()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(SubmitError::Closed(task)),
            Err(_) => return Err(SubmitError::Full(task)),
        };

        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        permit.send(WorkerMessage::Task(task));
        Ok(())
    }

    /// Poll until every submitted task has completed or failed
    pub async fn wait_completion(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.counters.settled() >= self.counters.submitted.load(Ordering::SeqCst) {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(COMPLETION_POLL_INTERVAL).await;
        }
    }

    /// Stop accepting, send one stop message per worker and join them.
    ///
    /// Stop messages share one `timeout`; each join then gets its own. Workers
    /// that do not exit in time are aborted and reported.
    pub async fn shutdown(&self, wait: bool, timeout: Duration) -> Result<(), PoolError> {
        if wait && !self.wait_completion(timeout).await {
            warn!(pool = %self.name, pending = self.pending(), "shutdown wait timed out");
        }

        {
            let _intake = self.intake.write().await;
            self.accepting.store(false, Ordering::SeqCst);
            self.cancel.cancel();
        }

        let workers = std::mem::take(&mut *self.workers.lock().await);
        if workers.is_empty() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for _ in &workers {
            match tokio::time::timeout_at(deadline, self.sender.send(WorkerMessage::Stop)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    debug!(pool = %self.name, "could not queue stop message");
                    break;
                }
            }
        }

        let mut stuck = Vec::new();
        for mut worker in workers {
            match tokio::time::timeout(timeout, &mut worker.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(pool = %self.name, worker_id = worker.id, error = %e, "worker ended abnormally"),
                Err(_) => {
                    worker.handle.abort();
                    let _ = tokio::time::timeout(ABORT_GRACE, &mut worker.handle).await;
                    stuck.push(worker.id);
                }
            }
        }

        if stuck.is_empty() {
            info!(pool = %self.name, "worker pool shut down");
            Ok(())
        } else {
            error!(pool = %self.name, workers = ?stuck, "force-stopped workers after shutdown timeout");
            Err(PoolError::ShutdownTimeout {
                pool: self.name.clone(),
                workers: stuck,
            })
        }
    }

    pub fn pending(&self) -> u64 {
        self.counters
            .submitted
            .load(Ordering::SeqCst)
            .saturating_sub(self.counters.settled())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            pending: self.pending(),
            queued: self.queue_capacity.saturating_sub(self.sender.capacity()),
            queue_capacity: self.queue_capacity,
            live_workers: self.counters.live_workers.load(Ordering::SeqCst),
            worker_errors: self
                .counters
                .worker_errors
                .iter()
                .map(|count| count.load(Ordering::SeqCst))
                .collect(),
            accepting: self.is_accepting(),
        }
    }
}
