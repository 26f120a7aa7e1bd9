//! Activation checkpointing for the host backend.
//!
//! The checkpointed forward runs with recording off, so no intermediate
//! node reaches the tape. Its output hangs off a single `checkpoint` node
//! whose inputs are the original input nodes. `recompute` forks the output,
//! routes the phony through a `recompute` node and joins it back, so during
//! backward the partition is re-run before the gradient reaches the
//! checkpoint node.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::tape::Tape;
use super::tensor::HostTensor;
use super::{fork_on, join_on, HostPhony};
use crate::backend::{Checkpoint, Partition};
use crate::batch::Batch;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Checkpointing,
    Recomputing,
}

thread_local! {
    static MODE: Cell<Mode> = const { Cell::new(Mode::Normal) };
}

/// Whether the calling thread is inside a checkpointed forward.
pub fn is_checkpointing() -> bool {
    MODE.with(|m| m.get() == Mode::Checkpointing)
}

/// Whether the calling thread is re-running a partition for backward.
pub fn is_recomputing() -> bool {
    MODE.with(|m| m.get() == Mode::Recomputing)
}

/// Host ops record tape nodes only outside checkpoint and recompute runs.
pub(crate) fn recording() -> bool {
    MODE.with(|m| m.get() == Mode::Normal)
}

struct ModeGuard(Mode);

impl ModeGuard {
    fn enter(mode: Mode) -> Self {
        Self(MODE.with(|m| m.replace(mode)))
    }
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        MODE.with(|m| m.set(self.0));
    }
}

// ── HostCheckpoint ───────────────────────────────────────────────────────────

pub struct HostCheckpoint {
    tape: Arc<Tape>,
    partition: Arc<dyn Partition<HostTensor>>,
    input: Batch<HostTensor>,
    forwarded: AtomicBool,
    recomputed: AtomicBool,
}

impl HostCheckpoint {
    pub(crate) fn new(
        tape: Arc<Tape>,
        partition: Arc<dyn Partition<HostTensor>>,
        input: Batch<HostTensor>,
    ) -> Self {
        Self {
            tape,
            partition,
            input,
            forwarded: AtomicBool::new(false),
            recomputed: AtomicBool::new(false),
        }
    }
}

impl Checkpoint<HostTensor> for HostCheckpoint {
    fn checkpoint(&self) -> anyhow::Result<Batch<HostTensor>> {
        if self.forwarded.swap(true, Ordering::SeqCst) {
            anyhow::bail!("checkpoint for {} already ran", self.partition.name());
        }

        let output = {
            let _mode = ModeGuard::enter(Mode::Checkpointing);
            self.partition.forward(&self.input)?
        };

        let node = self.tape.record(
            "checkpoint",
            self.input.tensors().iter().map(HostTensor::node),
        );
        Ok(output.map(|t| t.with_node(Some(node))))
    }

    fn recompute(&self, output: &mut Batch<HostTensor>) -> Result<()> {
        if !self.forwarded.load(Ordering::SeqCst) {
            return Err(PipelineError::Finalize(
                "recompute scheduled before checkpoint ran".into(),
            ));
        }
        if self.recomputed.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::Finalize("recompute already scheduled".into()));
        }

        let (forked, phony) = fork_on(&self.tape, output.first()?);

        let partition = Arc::clone(&self.partition);
        let input = self.input.clone();
        let node = self.tape.record_with_hook(
            "recompute",
            [Some(phony.node())],
            Box::new(move || {
                let _mode = ModeGuard::enter(Mode::Recomputing);
                debug!(partition = partition.name(), "recomputing activations");
                partition.forward(&input).map(|_| ())
            }),
        );

        let joined = join_on(&self.tape, &forked, HostPhony::new(node));
        output.replace_first(joined)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
