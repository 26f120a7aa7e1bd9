//! Fence helpers: backward ordering and cross-stream transport.
//!
//! All three helpers rewrite batches in place through the [`Backend`] graph
//! edge operations. Failures are reported as [`PipelineError::Fence`].

use gpipe_types::Stream;

use crate::backend::Backend;
use crate::batch::Batch;
use crate::error::{PipelineError, Result};

/// Make the backward pass of `fork_from` wait for the backward pass of
/// `join_to`.
///
/// Forks the first tensor of `fork_from` into a phony value and joins it
/// into the first tensor of `join_to`. Only the first slot of each batch
/// changes.
pub fn depend<B: Backend>(
    backend: &B,
    fork_from: &mut Batch<B::Tensor>,
    join_to: &mut Batch<B::Tensor>,
) -> Result<()> {
    let (forked, phony) = backend
        .fork(first(fork_from, "fork")?)
        .map_err(|e| fence("fork", e))?;
    fork_from.replace_first(forked)?;

    let joined = backend
        .join(first(join_to, "join")?, phony)
        .map_err(|e| fence("join", e))?;
    join_to.replace_first(joined)
}

/// Transport every tensor of `batch` from `prev` onto `next`.
pub fn copy<B: Backend>(
    backend: &B,
    batch: &mut Batch<B::Tensor>,
    prev: Stream,
    next: Stream,
) -> Result<()> {
    let moved = backend
        .copy_apply(prev, next, batch.tensors())
        .map_err(|e| fence("copy", e))?;
    batch.replace_all(moved)
}

/// Make `next` observe everything `prev` has produced for `batch`.
pub fn wait<B: Backend>(
    backend: &B,
    batch: &mut Batch<B::Tensor>,
    prev: Stream,
    next: Stream,
) -> Result<()> {
    let synced = backend
        .wait_apply(prev, next, batch.tensors())
        .map_err(|e| fence("wait", e))?;
    batch.replace_all(synced)
}

fn first<'a, T>(batch: &'a Batch<T>, op: &str) -> Result<&'a T> {
    batch
        .first()
        .map_err(|_| PipelineError::Fence(format!("{op}: batch has no tensors")))
}

fn fence(op: &str, err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Fence(_) => err,
        other => PipelineError::Fence(format!("{op}: {other}")),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use gpipe_types::Device;

    use super::*;
    use crate::host::{EventKind, HostBackend, Phase};

    #[test]
    fn depend_rewrites_first_slots_only() {
        let backend = HostBackend::new();
        let a0 = backend.tensor(vec![1.0]);
        let a1 = backend.tensor(vec![2.0]);
        let b0 = backend.tensor(vec![3.0]);
        let mut a = Batch::new(vec![a0.clone(), a1.clone()]);
        let mut b = Batch::atomic(b0.clone());

        depend(&backend, &mut a, &mut b).unwrap();

        assert_ne!(a[0].node(), a0.node());
        assert_eq!(a[1].node(), a1.node());
        assert_ne!(b[0].node(), b0.node());
        assert_eq!(a[0].values(), &[1.0]);
        assert_eq!(b[0].values(), &[3.0]);
        assert_eq!(backend.tape().count_label("fork"), 1);
        assert_eq!(backend.tape().count_label("join"), 1);
    }

    #[test]
    fn depend_on_empty_batch_is_a_fence_error() {
        let backend = HostBackend::new();
        let mut a = Batch::new(vec![]);
        let mut b = Batch::atomic(backend.tensor(vec![1.0]));
        let err = depend(&backend, &mut a, &mut b).unwrap_err();
        assert!(matches!(err, PipelineError::Fence(_)));
    }

    #[test]
    fn copy_moves_every_tensor() {
        let backend = HostBackend::new();
        let prev = Stream::default_for(Device::Cpu);
        let next = backend.new_stream(Device::Accelerator(0)).unwrap();
        let mut batch = Batch::new(vec![backend.tensor(vec![1.0]), backend.tensor(vec![2.0])]);

        copy(&backend, &mut batch, prev, next).unwrap();

        assert!(batch.tensors().iter().all(|t| t.device() == Device::Accelerator(0)));
        let events = backend.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Copy
            && e.phase == Phase::Forward
            && e.from == prev
            && e.to == next));
    }

    #[test]
    fn wait_keeps_values_and_device() {
        let backend = HostBackend::new();
        let prev = backend.new_stream(Device::Cpu).unwrap();
        let next = Stream::default_for(Device::Cpu);
        let mut batch = Batch::atomic(backend.tensor(vec![4.0, 5.0]));

        wait(&backend, &mut batch, prev, next).unwrap();

        assert_eq!(batch[0].values(), &[4.0, 5.0]);
        assert_eq!(batch[0].device(), Device::Cpu);
        assert_eq!(backend.events()[0].kind, EventKind::Wait);
    }
}
