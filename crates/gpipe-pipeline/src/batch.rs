//! Micro-batch container.
//!
//! A [`Batch`] is the unit that flows through the pipeline. The driver owns
//! one per micro-batch and rewrites it in place as the micro-batch moves
//! from partition to partition.

use std::ops::Index;

use crate::backend::Partition;
use crate::error::{PipelineError, Result};

/// An ordered sequence of tensors making up one micro-batch.
///
/// `atomic` records whether the batch was built from a single tensor, so
/// that gathering can hand back a single tensor again.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    tensors: Vec<T>,
    atomic: bool,
}

impl<T> Batch<T> {
    /// A batch holding exactly one tensor.
    pub fn atomic(tensor: T) -> Self {
        Self {
            tensors: vec![tensor],
            atomic: true,
        }
    }

    /// A batch holding a tuple of tensors.
    pub fn new(tensors: Vec<T>) -> Self {
        Self {
            tensors,
            atomic: false,
        }
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    /// The single tensor of an atomic batch.
    pub fn tensor(&self) -> Result<&T> {
        if !self.atomic {
            return Err(PipelineError::Batch("not an atomic batch".into()));
        }
        self.first()
    }

    pub fn tensors(&self) -> &[T] {
        &self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn first(&self) -> Result<&T> {
        self.tensors
            .first()
            .ok_or_else(|| PipelineError::Batch("batch has no tensors".into()))
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.tensors.get(index)
    }

    /// Replace the first tensor in place.
    pub fn replace_first(&mut self, tensor: T) -> Result<()> {
        match self.tensors.first_mut() {
            Some(slot) => {
                *slot = tensor;
                Ok(())
            }
            None => Err(PipelineError::Batch("cannot replace in an empty batch".into())),
        }
    }

    /// Replace every tensor in place. The tensor count must not change.
    pub fn replace_all(&mut self, tensors: Vec<T>) -> Result<()> {
        if tensors.len() != self.tensors.len() {
            return Err(PipelineError::Batch(format!(
                "expected {} tensors, got {}",
                self.tensors.len(),
                tensors.len()
            )));
        }
        self.tensors = tensors;
        Ok(())
    }

    /// Apply `f` to every tensor, keeping atomicity.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Batch<U> {
        Batch {
            tensors: self.tensors.into_iter().map(f).collect(),
            atomic: self.atomic,
        }
    }

    /// Run `partition` on this batch.
    pub fn call(&self, partition: &dyn Partition<T>) -> anyhow::Result<Batch<T>> {
        partition.forward(self)
    }

    pub fn into_tensors(self) -> Vec<T> {
        self.tensors
    }
}

impl<T> Index<usize> for Batch<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.tensors[index]
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FnPartition;

    #[test]
    fn atomic_batch() {
        let b = Batch::atomic(7);
        assert!(b.is_atomic());
        assert_eq!(*b.tensor().unwrap(), 7);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn tuple_batch_has_no_single_tensor() {
        let b = Batch::new(vec![1, 2]);
        assert!(!b.is_atomic());
        assert!(b.tensor().is_err());
        assert_eq!(b[1], 2);
    }

    #[test]
    fn replace_first_keeps_rest() {
        let mut b = Batch::new(vec![1, 2, 3]);
        b.replace_first(10).unwrap();
        assert_eq!(b.tensors(), &[10, 2, 3]);
    }

    #[test]
    fn replace_in_empty_batch_fails() {
        let mut b: Batch<i32> = Batch::new(vec![]);
        assert!(b.replace_first(1).is_err());
        assert!(b.first().is_err());
    }

    #[test]
    fn replace_all_checks_length() {
        let mut b = Batch::new(vec![1, 2]);
        assert!(b.replace_all(vec![3]).is_err());
        b.replace_all(vec![3, 4]).unwrap();
        assert_eq!(b.tensors(), &[3, 4]);
    }

    #[test]
    fn call_runs_partition() {
        let double = FnPartition::new("double", |b: &Batch<i32>| -> anyhow::Result<Batch<i32>> {
            Ok(b.clone().map(|x| x * 2))
        });
        let out = Batch::atomic(21).call(&double).unwrap();
        assert_eq!(*out.tensor().unwrap(), 42);
        assert!(out.is_atomic());
    }
}
