//! Bounded worker pool for probe and dispatch tasks.
//!
//! A fixed set of workers drains a bounded queue; each task runs under a
//! per-task deadline with a derived cancellation token and panic capture,
//! so one misbehaving handler can neither wedge a worker nor take the pool
//! down. The queue bound is the monitor's back-pressure mechanism: when it
//! saturates, submission fails and the caller drops the work instead of
//! blocking the reconciler.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{MonitorError, MonitorResult};

/// Construction-time pool parameters.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Maximum concurrently executing tasks.
    pub max_workers: usize,
    /// Bound on the pending-task queue.
    pub queue_size: usize,
    /// Per-task execution deadline.
    pub task_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            queue_size: 64,
            task_timeout: Duration::from_secs(10),
        }
    }
}

type TaskFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// One unit of work submitted to the pool.
pub struct PoolTask {
    label: String,
    run: TaskFn,
}

impl PoolTask {
    /// Wrap a closure producing the task future. The closure receives a
    /// token derived from the pool's shutdown token that also fires when
    /// the per-task deadline elapses.
    pub fn new<F>(label: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Box::new(run),
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    active_workers: AtomicUsize,
    queued_tasks: AtomicUsize,
    completed_tasks: AtomicU64,
    failed_tasks: AtomicU64,
    timeout_tasks: AtomicU64,
}

/// Point-in-time pool statistics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub active_workers: usize,
    pub queued_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub timeout_tasks: u64,
    pub max_workers: usize,
}

struct PoolRuntime {
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

/// Fixed-capacity task executor.
pub struct WorkerPool {
    config: PoolConfig,
    counters: Arc<PoolCounters>,
    sender: RwLock<Option<mpsc::Sender<PoolTask>>>,
    runtime: Mutex<Option<PoolRuntime>>,
    running: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            counters: Arc::new(PoolCounters::default()),
            sender: RwLock::new(None),
            runtime: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the worker set. Fails with `AlreadyRunning` if started twice.
    pub async fn start(&self) -> MonitorResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MonitorError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::channel::<PoolTask>(self.config.queue_size);
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();

        let mut workers = Vec::with_capacity(self.config.max_workers);
        for worker_id in 0..self.config.max_workers {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&rx),
                Arc::clone(&self.counters),
                shutdown.clone(),
                self.config.task_timeout,
            )));
        }

        *self.sender.write().await = Some(tx);
        *self.runtime.lock().await = Some(PoolRuntime { workers, shutdown });
        debug!(
            max_workers = self.config.max_workers,
            queue_size = self.config.queue_size,
            "worker pool started"
        );
        Ok(())
    }

    /// Enqueue a task. Fails when the pool is stopped or the queue is full.
    pub async fn submit(&self, task: PoolTask) -> MonitorResult<()> {
        if !self.is_running() {
            return Err(MonitorError::NotRunning);
        }
        let sender = self.sender.read().await;
        let Some(tx) = sender.as_ref() else {
            return Err(MonitorError::NotRunning);
        };
        match tx.try_send(task) {
            Ok(()) => {
                self.counters.queued_tasks.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(label = %task.label, "worker pool queue full, rejecting task");
                Err(MonitorError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MonitorError::NotRunning),
        }
    }

    /// Stop accepting work and drain in-flight tasks within `deadline`.
    ///
    /// Residual tasks past the deadline get their derived tokens fired and
    /// are aborted. Stopping a stopped pool is a no-op.
    pub async fn stop(&self, deadline: Duration) -> MonitorResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        // Closing the channel lets workers drain the backlog and exit.
        *self.sender.write().await = None;

        let Some(runtime) = self.runtime.lock().await.take() else {
            return Ok(());
        };

        let deadline_at = tokio::time::Instant::now() + deadline;
        for mut handle in runtime.workers {
            let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                runtime.shutdown.cancel();
                handle.abort();
            }
        }
        debug!("worker pool stopped");
        Ok(())
    }

    /// Count a failure observed inside a composite task.
    ///
    /// Event-delivery tasks invoke several handlers each; a failing or
    /// panicking handler is charged here so `failed_tasks` still reflects
    /// every handler failure, not just whole-task outcomes.
    pub fn record_failure(&self) {
        self.counters.failed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active_workers: self.counters.active_workers.load(Ordering::Relaxed),
            queued_tasks: self.counters.queued_tasks.load(Ordering::Relaxed),
            completed_tasks: self.counters.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.counters.failed_tasks.load(Ordering::Relaxed),
            timeout_tasks: self.counters.timeout_tasks.load(Ordering::Relaxed),
            max_workers: self.config.max_workers,
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<PoolTask>>>,
    counters: Arc<PoolCounters>,
    shutdown: CancellationToken,
    task_timeout: Duration,
) {
    loop {
        let task = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                task = guard.recv() => task,
            }
        };
        let Some(task) = task else {
            break;
        };

        counters.queued_tasks.fetch_sub(1, Ordering::Relaxed);
        counters.active_workers.fetch_add(1, Ordering::Relaxed);

        let task_token = shutdown.child_token();
        let label = task.label;
        let future = (task.run)(task_token.clone());

        match tokio::time::timeout(task_timeout, AssertUnwindSafe(future).catch_unwind()).await {
            Err(_) => {
                // The task future is dropped at this point; firing the
                // token stops any work it handed elsewhere.
                task_token.cancel();
                counters.timeout_tasks.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id, label = %label, timeout_ms = task_timeout.as_millis() as u64, "pool task timed out");
            }
            Ok(Err(_panic)) => {
                counters.failed_tasks.fetch_add(1, Ordering::Relaxed);
                error!(worker_id, label = %label, "pool task panicked");
            }
            Ok(Ok(Err(err))) => {
                counters.failed_tasks.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id, label = %label, error = %err, "pool task failed");
            }
            Ok(Ok(Ok(()))) => {
                counters.completed_tasks.fetch_add(1, Ordering::Relaxed);
            }
        }

        counters.active_workers.fetch_sub(1, Ordering::Relaxed);
    }
}
