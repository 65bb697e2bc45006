//! Bounded worker pool.
//!
//! `size` long-lived workers share one FIFO of pending tasks. Admission is
//! bounded: [`Pool::submit`] waits for a slot whenever `pending + in-flight
//! == size`, so memory is bounded by the pool size rather than by the
//! submitter's pace. A slot is released when its task finishes.
//!
//! A task that fails or panics is logged with the worker's index and
//! dropped; the worker moves on to the next task. The pool never retries.

use crate::error::{Error, Result};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// How long an idle worker sleeps before re-checking the queue on its own,
/// in case a wake-up was missed.
const IDLE_WATCHDOG: Duration = Duration::from_secs(60);

/// A unit of work accepted by the pool.
pub type Task = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

struct Job {
    task: Task,
    _slot: OwnedSemaphorePermit,
}

struct Shared {
    pending: Mutex<VecDeque<Job>>,
    work_ready: Notify,
    slots: Arc<Semaphore>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_idle(&self) -> bool {
        let pending = self.pending();
        pending.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Pop the next job, counting it in-flight while the queue is still
    /// locked so `drain` never observes it in neither place.
    fn claim(&self) -> Option<Job> {
        let mut pending = self.pending();
        let job = pending.pop_front()?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(job)
    }
}

/// Fixed-size pool of workers executing submitted tasks.
pub struct Pool {
    shared: Arc<Shared>,
    size: usize,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Spawn `size` workers on the current tokio runtime.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("pool size must be at least 1".to_string()));
        }
        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            work_ready: Notify::new(),
            slots: Arc::new(Semaphore::new(size)),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        let workers = (0..size)
            .map(|worker| tokio::spawn(run_worker(worker, Arc::clone(&shared))))
            .collect();
        debug!(size, "pool started");
        Ok(Self {
            shared,
            size,
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently executing.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Tasks admitted but not yet claimed by a worker.
    pub fn pending(&self) -> usize {
        self.shared.pending().len()
    }

    /// Admit a task, waiting while every slot is taken.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let slot = Arc::clone(&self.shared.slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("pool is closed".to_string()))?;
        self.shared.pending().push_back(Job {
            task: Box::pin(task),
            _slot: slot,
        });
        self.shared.work_ready.notify_one();
        Ok(())
    }

    /// Wait until nothing is pending and nothing is running.
    pub async fn drain(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.shared.is_idle() {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for Pool {
    /// Stops the workers. A task already running completes on its own.
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn run_worker(worker: usize, shared: Arc<Shared>) {
    loop {
        let Some(job) = shared.claim() else {
            tokio::select! {
                _ = shared.work_ready.notified() => {}
                _ = tokio::time::sleep(IDLE_WATCHDOG) => {}
            }
            continue;
        };

        let Job { task, _slot: slot } = job;
        let started = Instant::now();
        // Run on its own task so a panic surfaces as a JoinError here
        // instead of killing the worker.
        let outcome = match tokio::spawn(task).await {
            Ok(Ok(())) => "ok",
            Ok(Err(e)) => {
                error!(worker, error = %e, "task failed");
                "error"
            }
            Err(e) => {
                error!(worker, error = %e, "task panicked");
                "panic"
            }
        };
        metrics::pool_tasks().add(1, &[KeyValue::new("outcome", outcome)]);
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "pool.task")],
        );

        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(slot);
        if shared.is_idle() {
            shared.idle.notify_waiters();
        }
    }
}
