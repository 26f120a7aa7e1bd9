//! Collaborator seams consumed by the scheduler.
//!
//! The driver never touches tensors, streams or the backward graph directly.
//! Everything goes through an injected [`Backend`], which supplies:
//!
//! - stream handling: current stream per device, fresh streams, and scoped
//!   "make this stream current" execution;
//! - graph edges: `fork`/`join` (backward ordering via a phony value) and
//!   `copy_apply`/`wait_apply` (stream-aware transport and barriers that are
//!   mirrored on the backward path);
//! - the checkpointing adapter;
//! - micro-batch splitting and concatenation.

use std::fmt;
use std::sync::Arc;

use gpipe_types::{Device, Stream};

use crate::batch::Batch;
use crate::error::Result;

// ── Backend ──────────────────────────────────────────────────────────────────

pub trait Backend: Send + Sync + 'static {
    /// Tensor handle. Cloning must be cheap (a reference, not a deep copy).
    type Tensor: Clone + Send + Sync + 'static;

    /// Zero-cost value carrying a backward-graph edge.
    type Phony: Send + 'static;

    // ── Streams ──────────────────────────────────────────────────────────

    /// The stream currently in effect for `device` on the calling thread.
    fn current_stream(&self, device: Device) -> Stream;

    /// Allocate a new stream on `device`.
    fn new_stream(&self, device: Device) -> Result<Stream>;

    /// Run `f` with `stream` current on its device, restoring the previous
    /// stream afterwards.
    fn with_stream<R>(&self, stream: Stream, f: impl FnOnce() -> R) -> R;

    // ── Graph edges ──────────────────────────────────────────────────────

    fn fork(&self, tensor: &Self::Tensor) -> Result<(Self::Tensor, Self::Phony)>;

    fn join(&self, tensor: &Self::Tensor, phony: Self::Phony) -> Result<Self::Tensor>;

    /// Transport `tensors` from `prev` to `next`. The forward path makes
    /// `next` depend on `prev`; the backward path records the reverse.
    fn copy_apply(
        &self,
        prev: Stream,
        next: Stream,
        tensors: &[Self::Tensor],
    ) -> Result<Vec<Self::Tensor>>;

    /// Make `next` wait for `prev` before touching `tensors`, symmetrically
    /// on the backward path.
    fn wait_apply(
        &self,
        prev: Stream,
        next: Stream,
        tensors: &[Self::Tensor],
    ) -> Result<Vec<Self::Tensor>>;

    // ── Checkpointing ────────────────────────────────────────────────────

    /// Build a single-use checkpointing adapter for one micro-batch.
    fn checkpointing(
        &self,
        partition: Arc<dyn Partition<Self::Tensor>>,
        input: Batch<Self::Tensor>,
    ) -> Arc<dyn Checkpoint<Self::Tensor>>;

    // ── Micro-batching ───────────────────────────────────────────────────

    /// Split `tensor` along its batch dimension into at most `chunks` pieces.
    fn chunk(&self, tensor: &Self::Tensor, chunks: usize) -> Result<Vec<Self::Tensor>>;

    /// Concatenate `tensors` along the batch dimension.
    fn cat(&self, tensors: &[Self::Tensor]) -> Result<Self::Tensor>;
}

// ── Partition ────────────────────────────────────────────────────────────────

/// One contiguous slice of a model, executed end-to-end on one device.
pub trait Partition<T>: Send + Sync {
    fn forward(&self, input: &Batch<T>) -> anyhow::Result<Batch<T>>;

    /// Device this partition's parameters live on.
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn name(&self) -> &str {
        "partition"
    }
}

/// A [`Partition`] backed by a closure.
pub struct FnPartition<F> {
    name: String,
    device: Device,
    f: F,
}

impl<F> FnPartition<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            device: Device::Cpu,
            f,
        }
    }

    pub fn on(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

impl<T, F> Partition<T> for FnPartition<F>
where
    F: Fn(&Batch<T>) -> anyhow::Result<Batch<T>> + Send + Sync,
{
    fn forward(&self, input: &Batch<T>) -> anyhow::Result<Batch<T>> {
        (self.f)(input)
    }

    fn device(&self) -> Device {
        self.device
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnPartition<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPartition")
            .field("name", &self.name)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

// ── Checkpoint adapter ───────────────────────────────────────────────────────

/// Activation checkpointing for one (partition, micro-batch) pair.
///
/// `checkpoint` runs on a worker and returns an output that references the
/// inputs but none of the intermediate activations. `recompute` runs on the
/// driver afterwards and attaches the backward node that re-derives them.
/// Each adapter is used for exactly one micro-batch.
pub trait Checkpoint<T>: Send + Sync {
    fn checkpoint(&self) -> anyhow::Result<Batch<T>>;

    fn recompute(&self, output: &mut Batch<T>) -> Result<()>;
}
