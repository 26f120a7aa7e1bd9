//! Splitting a mini-batch into micro-batches and merging them back.

use crate::backend::Backend;
use crate::batch::Batch;
use crate::error::{PipelineError, Result};

/// Split every tensor of `inputs` into at most `chunks` pieces along the batch
/// dimension and zip the pieces into micro-batches.
///
/// A single input yields atomic batches. Every input must split into the
/// same number of pieces; fewer than `chunks` is allowed when the batch
/// dimension is shorter than `chunks`.
pub fn scatter<B: Backend>(
    backend: &B,
    inputs: &[B::Tensor],
    chunks: usize,
) -> Result<Vec<Batch<B::Tensor>>> {
    if inputs.is_empty() {
        return Err(PipelineError::Balance("no input tensors to scatter".into()));
    }

    let mut columns: Vec<Vec<B::Tensor>> = Vec::with_capacity(inputs.len());
    for (slot, input) in inputs.iter().enumerate() {
        let pieces = backend.chunk(input, chunks)?;
        if let Some(first) = columns.first().map(Vec::len) {
            if pieces.len() != first {
                return Err(PipelineError::Balance(format!(
                    "input {slot} splits into {} micro-batches, input 0 into {first}",
                    pieces.len()
                )));
            }
        }
        columns.push(pieces);
    }

    if let [only] = columns.as_mut_slice() {
        return Ok(only.drain(..).map(Batch::atomic).collect());
    }

    let m = columns[0].len();
    let mut iters: Vec<_> = columns.into_iter().map(Vec::into_iter).collect();
    let mut batches = Vec::with_capacity(m);
    for _ in 0..m {
        let tensors: Vec<_> = iters.iter_mut().filter_map(Iterator::next).collect();
        batches.push(Batch::new(tensors));
    }
    Ok(batches)
}

/// Concatenate micro-batches slot by slot into the mini-batch outputs.
pub fn gather<B: Backend>(backend: &B, batches: &[Batch<B::Tensor>]) -> Result<Vec<B::Tensor>> {
    let first = batches
        .first()
        .ok_or_else(|| PipelineError::Balance("no micro-batches to gather".into()))?;
    let width = first.len();

    if let Some((j, b)) = batches.iter().enumerate().find(|(_, b)| b.len() != width) {
        return Err(PipelineError::Balance(format!(
            "micro-batch {j} has {} tensors, micro-batch 0 has {width}",
            b.len()
        )));
    }

    (0..width)
        .map(|slot| {
            let column: Vec<_> = batches.iter().map(|b| b[slot].clone()).collect();
            backend.cat(&column)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBackend;

    #[test]
    fn scatter_single_input_is_atomic() {
        let backend = HostBackend::new();
        let x = backend.tensor(vec![1.0, 2.0, 3.0, 4.0]);
        let batches = scatter(&backend, &[x], 2).unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(Batch::is_atomic));
        assert_eq!(batches[1][0].values(), &[3.0, 4.0]);
    }

    #[test]
    fn scatter_multiple_inputs_zips_slots() {
        let backend = HostBackend::new();
        let a = backend.tensor(vec![1.0, 2.0, 3.0]);
        let b = backend.tensor(vec![10.0, 20.0, 30.0]);
        let batches = scatter(&backend, &[a, b], 3).unwrap();
        assert_eq!(batches.len(), 3);
        assert!(!batches[0].is_atomic());
        assert_eq!(batches[2][0].values(), &[3.0]);
        assert_eq!(batches[2][1].values(), &[30.0]);
    }

    #[test]
    fn short_batch_yields_fewer_chunks() {
        let backend = HostBackend::new();
        let x = backend.tensor(vec![1.0, 2.0]);
        assert_eq!(scatter(&backend, &[x], 8).unwrap().len(), 2);
    }

    #[test]
    fn mismatched_inputs_rejected() {
        let backend = HostBackend::new();
        let a = backend.tensor(vec![1.0, 2.0, 3.0, 4.0]);
        let b = backend.tensor(vec![1.0]);
        let err = scatter(&backend, &[a, b], 4).unwrap_err();
        assert!(matches!(err, PipelineError::Balance(_)));
        assert!(scatter(&backend, &[], 2).is_err());
    }

    #[test]
    fn gather_restores_scatter() {
        let backend = HostBackend::new();
        let a = backend.tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let b = backend.tensor(vec![5.0, 4.0, 3.0, 2.0, 1.0]);
        let batches = scatter(&backend, &[a.clone(), b.clone()], 2).unwrap();
        let out = gather(&backend, &batches).unwrap();
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn gather_checks_width() {
        let backend = HostBackend::new();
        let batches = vec![
            Batch::new(vec![backend.tensor(vec![1.0]), backend.tensor(vec![2.0])]),
            Batch::atomic(backend.tensor(vec![3.0])),
        ];
        assert!(gather(&backend, &batches).is_err());
        assert!(gather::<HostBackend>(&backend, &[]).is_err());
    }
}
