//! One worker thread per partition.
//!
//! Each worker owns an input queue of [`WorkerMessage`]s and an output queue
//! of [`Outcome`]s. Queues are unbounded tokio channels driven from plain
//! threads (`blocking_recv`), so per-worker FIFO order is preserved and the
//! driver never blocks on submission.
//!
//! [`WorkerPool`] is a scoped acquisition: dropping it sends `Shutdown` to
//! every worker and joins every thread, on the error path as well.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use gpipe_types::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::batch::Batch;
use crate::error::{PipelineError, Result};

pub type ComputeFn<T> = Box<dyn FnOnce() -> anyhow::Result<Batch<T>> + Send>;
pub type FinalizeFn<T> = Box<dyn FnOnce(&mut Batch<T>) -> Result<()> + Send>;

// ── Task ─────────────────────────────────────────────────────────────────────

/// Work for one schedule cell: a compute callable run on a worker with
/// `stream` current, and an optional finalize callable run by the driver on
/// the result.
pub struct Task<T> {
    pub partition: usize,
    pub micro_batch: usize,
    pub stream: Stream,
    compute: Option<ComputeFn<T>>,
    finalize: Option<FinalizeFn<T>>,
}

impl<T> Task<T> {
    pub fn new(
        partition: usize,
        micro_batch: usize,
        stream: Stream,
        compute: impl FnOnce() -> anyhow::Result<Batch<T>> + Send + 'static,
    ) -> Self {
        Self {
            partition,
            micro_batch,
            stream,
            compute: Some(Box::new(compute)),
            finalize: None,
        }
    }

    pub fn with_finalize(
        mut self,
        finalize: impl FnOnce(&mut Batch<T>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.finalize = Some(Box::new(finalize));
        self
    }

    pub fn has_finalize(&self) -> bool {
        self.finalize.is_some()
    }

    /// Run the compute callable with the task's stream current. Panics are
    /// caught and reported as errors.
    pub fn compute<B: Backend<Tensor = T>>(&mut self, backend: &B) -> anyhow::Result<Batch<T>> {
        let compute = self.compute.take().ok_or_else(|| {
            anyhow::anyhow!(
                "task ({}, {}) was already computed",
                self.partition,
                self.micro_batch
            )
        })?;

        backend.with_stream(self.stream, || {
            match panic::catch_unwind(AssertUnwindSafe(compute)) {
                Ok(result) => result,
                Err(payload) => Err(anyhow::anyhow!(
                    "partition panicked: {}",
                    panic_message(payload.as_ref())
                )),
            }
        })
    }

    /// Run the finalize callable, if any, with the task's stream current.
    pub fn finalize<B: Backend<Tensor = T>>(
        &mut self,
        backend: &B,
        batch: &mut Batch<T>,
    ) -> Result<()> {
        match self.finalize.take() {
            Some(finalize) => backend.with_stream(self.stream, || finalize(batch)),
            None => Ok(()),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("partition", &self.partition)
            .field("micro_batch", &self.micro_batch)
            .field("stream", &self.stream)
            .field("computed", &self.compute.is_none())
            .field("finalize", &self.finalize.is_some())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── Queue elements ───────────────────────────────────────────────────────────

pub enum WorkerMessage<T> {
    Task(Task<T>),
    Shutdown,
}

/// A compute failure captured on a worker.
#[derive(Debug)]
pub struct ComputeFailure {
    pub partition: usize,
    pub micro_batch: usize,
    pub error: anyhow::Error,
}

pub enum Outcome<T> {
    Completed { task: Task<T>, batch: Batch<T> },
    Failed(ComputeFailure),
}

// ── Worker pool ──────────────────────────────────────────────────────────────

pub struct WorkerPool<T> {
    in_queues: Vec<mpsc::UnboundedSender<WorkerMessage<T>>>,
    out_queues: Vec<mpsc::UnboundedReceiver<Outcome<T>>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `n` workers named `{name_prefix}-{i}`.
    pub fn spawn<B>(backend: Arc<B>, n: usize, name_prefix: &str) -> Result<Self>
    where
        B: Backend<Tensor = T>,
    {
        let mut pool = Self {
            in_queues: Vec::with_capacity(n),
            out_queues: Vec::with_capacity(n),
            handles: Vec::with_capacity(n),
        };

        for i in 0..n {
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let backend = Arc::clone(&backend);

            // An early return drops `pool`, which stops the workers spawned so far.
            let handle = thread::Builder::new()
                .name(format!("{name_prefix}-{i}"))
                .spawn(move || worker_loop(i, backend, in_rx, out_tx))
                .map_err(|e| PipelineError::Worker(format!("failed to spawn worker {i}: {e}")))?;

            pool.in_queues.push(in_tx);
            pool.out_queues.push(out_rx);
            pool.handles.push(handle);
        }

        debug!(workers = n, "spawned worker pool");
        Ok(pool)
    }
}

impl<T> WorkerPool<T> {
    pub fn len(&self) -> usize {
        self.in_queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_queues.is_empty()
    }

    /// Queue `task` on worker `worker`.
    pub fn submit(&self, worker: usize, task: Task<T>) -> Result<()> {
        let queue = self
            .in_queues
            .get(worker)
            .ok_or_else(|| PipelineError::Worker(format!("no worker {worker}")))?;
        queue
            .send(WorkerMessage::Task(task))
            .map_err(|_| PipelineError::Worker(format!("worker {worker} has stopped")))
    }

    /// Block until worker `worker` produces its next outcome.
    pub fn collect(&mut self, worker: usize) -> Result<Outcome<T>> {
        let queue = self
            .out_queues
            .get_mut(worker)
            .ok_or_else(|| PipelineError::Worker(format!("no worker {worker}")))?;
        queue
            .blocking_recv()
            .ok_or_else(|| PipelineError::Worker(format!("worker {worker} exited")))
    }

    /// Stop and join every worker. Idempotent.
    pub fn shutdown(&mut self) {
        for queue in &self.in_queues {
            // A worker that already exited has dropped its receiver.
            let _ = queue.send(WorkerMessage::Shutdown);
        }
        for (i, handle) in self.handles.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!(worker = i, "worker thread panicked");
            }
        }
        self.in_queues.clear();
        self.out_queues.clear();
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<B: Backend>(
    index: usize,
    backend: Arc<B>,
    mut in_queue: mpsc::UnboundedReceiver<WorkerMessage<B::Tensor>>,
    out_queue: mpsc::UnboundedSender<Outcome<B::Tensor>>,
) {
    while let Some(message) = in_queue.blocking_recv() {
        let mut task = match message {
            WorkerMessage::Task(task) => task,
            WorkerMessage::Shutdown => break,
        };

        let outcome = match task.compute(&*backend) {
            Ok(batch) => Outcome::Completed { task, batch },
            Err(error) => Outcome::Failed(ComputeFailure {
                partition: task.partition,
                micro_batch: task.micro_batch,
                error,
            }),
        };

        if out_queue.send(outcome).is_err() {
            break;
        }
    }
    debug!(worker = index, "worker exiting");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
