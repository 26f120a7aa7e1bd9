//! Host (CPU) reference backend.
//!
//! Streams are bookkeeping only: every `copy_apply`/`wait_apply` is logged
//! as a [`StreamEvent`], and the matching backward event is logged when the
//! backward pass runs through it. The backward graph lives on a recording
//! [`Tape`], which makes the ordering edges inserted by the scheduler
//! observable in tests and in the demo binary.

mod checkpoint;
mod tape;
mod tensor;

pub use checkpoint::{is_checkpointing, is_recomputing, HostCheckpoint};
pub use tape::{Hook, NodeId, Tape};
pub use tensor::HostTensor;

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use gpipe_types::{Device, Stream};

use crate::backend::{Backend, Checkpoint, Partition};
use crate::batch::Batch;
use crate::error::{PipelineError, Result};

// ── Stream events ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Copy,
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Forward,
    Backward,
}

/// One stream-ordering operation, as seen by the host backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub phase: Phase,
    pub from: Stream,
    pub to: Stream,
}

type EventLog = Arc<Mutex<Vec<StreamEvent>>>;

fn log_event(log: &EventLog, event: StreamEvent) {
    log.lock().unwrap_or_else(PoisonError::into_inner).push(event);
}

// ── Phony ────────────────────────────────────────────────────────────────────

/// Backward-graph edge produced by `fork` and consumed by `join`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPhony(NodeId);

impl HostPhony {
    pub(crate) fn new(node: NodeId) -> Self {
        Self(node)
    }

    pub fn node(&self) -> NodeId {
        self.0
    }
}

pub(crate) fn fork_on(tape: &Tape, tensor: &HostTensor) -> (HostTensor, HostPhony) {
    let node = tape.record("fork", [tensor.node()]);
    (tensor.with_node(Some(node)), HostPhony(node))
}

pub(crate) fn join_on(tape: &Tape, tensor: &HostTensor, phony: HostPhony) -> HostTensor {
    let node = tape.record("join", [tensor.node(), Some(phony.0)]);
    tensor.with_node(Some(node))
}

// ── Current stream ───────────────────────────────────────────────────────────

thread_local! {
    static CURRENT: RefCell<HashMap<Device, Stream>> = RefCell::new(HashMap::new());
}

struct StreamGuard {
    device: Device,
    previous: Option<Stream>,
}

impl StreamGuard {
    fn enter(stream: Stream) -> Self {
        let previous = CURRENT.with(|c| c.borrow_mut().insert(stream.device, stream));
        Self {
            device: stream.device,
            previous,
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            let mut current = c.borrow_mut();
            match self.previous {
                Some(prev) => current.insert(self.device, prev),
                None => current.remove(&self.device),
            };
        });
    }
}

// ── HostBackend ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct HostBackend {
    tape: Arc<Tape>,
    events: EventLog,
    next_stream_id: AtomicU32,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            tape: Arc::new(Tape::new()),
            events: Arc::new(Mutex::new(Vec::new())),
            next_stream_id: AtomicU32::new(Stream::DEFAULT_ID + 1),
        }
    }

    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    /// Snapshot of every stream event logged so far.
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Tensor construction and ops ──────────────────────────────────────

    /// A leaf tensor on the CPU.
    pub fn tensor(&self, values: impl Into<Vec<f32>>) -> HostTensor {
        self.tensor_on(values, Device::Cpu)
    }

    pub fn tensor_on(&self, values: impl Into<Vec<f32>>, device: Device) -> HostTensor {
        let values: Vec<f32> = values.into();
        let node = self.record("leaf", []);
        HostTensor::new(values.into(), device, node)
    }

    /// Element-wise op. Records a node labelled `label` unless recording is
    /// off on this thread.
    pub fn map(&self, tensor: &HostTensor, label: &str, f: impl Fn(f32) -> f32) -> HostTensor {
        let values: Vec<f32> = tensor.values().iter().map(|x| f(*x)).collect();
        let node = self.record(label, [tensor.node()]);
        HostTensor::new(values.into(), tensor.device(), node)
    }

    /// Identity op whose node fires `hook` during backward.
    pub fn on_backward(
        &self,
        tensor: &HostTensor,
        label: &str,
        hook: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) -> HostTensor {
        if !checkpoint::recording() {
            return tensor.clone();
        }
        let node = self
            .tape
            .record_with_hook(label, [tensor.node()], Box::new(hook));
        tensor.with_node(Some(node))
    }

    /// Run the backward pass from `roots`.
    pub fn backward(&self, roots: &[HostTensor]) -> Result<Vec<NodeId>> {
        let nodes: Vec<NodeId> = roots.iter().filter_map(HostTensor::node).collect();
        self.tape.backward(&nodes)
    }

    fn record<I>(&self, label: &str, inputs: I) -> Option<NodeId>
    where
        I: IntoIterator<Item = Option<NodeId>>,
    {
        checkpoint::recording().then(|| self.tape.record(label, inputs))
    }

    fn transport(
        &self,
        kind: EventKind,
        prev: Stream,
        next: Stream,
        tensors: &[HostTensor],
    ) -> Vec<HostTensor> {
        let label = match kind {
            EventKind::Copy => "copy",
            EventKind::Wait => "wait",
        };
        tensors
            .iter()
            .map(|t| {
                log_event(&self.events, StreamEvent { kind, phase: Phase::Forward, from: prev, to: next });

                let events = Arc::clone(&self.events);
                let node = self.tape.record_with_hook(
                    label,
                    [t.node()],
                    Box::new(move || {
                        log_event(&events, StreamEvent { kind, phase: Phase::Backward, from: next, to: prev });
                        Ok(())
                    }),
                );
                let device = match kind {
                    EventKind::Copy => next.device,
                    EventKind::Wait => t.device(),
                };
                t.moved_to(device, Some(node))
            })
            .collect()
    }
}

impl Backend for HostBackend {
    type Tensor = HostTensor;
    type Phony = HostPhony;

    fn current_stream(&self, device: Device) -> Stream {
        CURRENT
            .with(|c| c.borrow().get(&device).copied())
            .unwrap_or_else(|| Stream::default_for(device))
    }

    fn new_stream(&self, device: Device) -> Result<Stream> {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        Ok(Stream::new(device, id))
    }

    fn with_stream<R>(&self, stream: Stream, f: impl FnOnce() -> R) -> R {
        let _guard = StreamGuard::enter(stream);
        f()
    }

    fn fork(&self, tensor: &HostTensor) -> Result<(HostTensor, HostPhony)> {
        Ok(fork_on(&self.tape, tensor))
    }

    fn join(&self, tensor: &HostTensor, phony: HostPhony) -> Result<HostTensor> {
        Ok(join_on(&self.tape, tensor, phony))
    }

    fn copy_apply(&self, prev: Stream, next: Stream, tensors: &[HostTensor]) -> Result<Vec<HostTensor>> {
        Ok(self.transport(EventKind::Copy, prev, next, tensors))
    }

    fn wait_apply(&self, prev: Stream, next: Stream, tensors: &[HostTensor]) -> Result<Vec<HostTensor>> {
        if prev.device != next.device {
            return Err(PipelineError::Backend(format!(
                "cannot wait across devices: {prev} → {next}"
            )));
        }
        Ok(self.transport(EventKind::Wait, prev, next, tensors))
    }

    fn checkpointing(
        &self,
        partition: Arc<dyn Partition<HostTensor>>,
        input: Batch<HostTensor>,
    ) -> Arc<dyn Checkpoint<HostTensor>> {
        Arc::new(HostCheckpoint::new(Arc::clone(&self.tape), partition, input))
    }

    fn chunk(&self, tensor: &HostTensor, chunks: usize) -> Result<Vec<HostTensor>> {
        if chunks == 0 {
            return Err(PipelineError::Balance("chunks must be at least 1".into()));
        }
        if tensor.is_empty() {
            return Err(PipelineError::Balance("cannot split an empty tensor".into()));
        }
        let size = tensor.len().div_ceil(chunks);
        Ok(tensor
            .values()
            .chunks(size)
            .map(|piece| {
                let node = self.record("chunk", [tensor.node()]);
                HostTensor::new(piece.into(), tensor.device(), node)
            })
            .collect())
    }

    fn cat(&self, tensors: &[HostTensor]) -> Result<HostTensor> {
        let first = tensors
            .first()
            .ok_or_else(|| PipelineError::Balance("nothing to concatenate".into()))?;
        if let Some(other) = tensors.iter().find(|t| t.device() != first.device()) {
            return Err(PipelineError::Balance(format!(
                "cannot concatenate tensors on {} and {}",
                first.device(),
                other.device()
            )));
        }
        if tensors.len() == 1 {
            return Ok(first.clone());
        }
        let values: Vec<f32> = tensors.iter().flat_map(|t| t.values().iter().copied()).collect();
        let node = self.record("cat", tensors.iter().map(HostTensor::node));
        Ok(HostTensor::new(values.into(), first.device(), node))
    }
}

// ── Affine partition ─────────────────────────────────────────────────────────

/// Partition computing `x * scale + shift` on every tensor of a batch.
pub struct Affine {
    backend: Arc<HostBackend>,
    name: String,
    device: Device,
    scale: f32,
    shift: f32,
}

impl Affine {
    pub fn new(backend: Arc<HostBackend>, name: impl Into<String>, scale: f32, shift: f32) -> Self {
        Self {
            backend,
            name: name.into(),
            device: Device::Cpu,
            scale,
            shift,
        }
    }

    pub fn on(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

impl Partition<HostTensor> for Affine {
    fn forward(&self, input: &Batch<HostTensor>) -> anyhow::Result<Batch<HostTensor>> {
        let (scale, shift) = (self.scale, self.shift);
        Ok(input
            .clone()
            .map(|t| self.backend.map(&t, &self.name, |x| x * scale + shift)))
    }

    fn device(&self) -> Device {
        self.device
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
