//! The user-facing pipeline-parallel wrapper.
//!
//! [`GPipe`] owns the partitions and their placement. Every [`forward`]
//! splits the mini-batch into micro-batches, drives them through a fresh
//! [`Pipeline`] and concatenates the outputs.
//!
//! [`forward`]: GPipe::forward

use std::sync::Arc;

use gpipe_types::{CheckpointMode, Device, GPipeConfig, Stream};
use tracing::debug;

use crate::backend::{Backend, Partition};
use crate::error::{PipelineError, Result};
use crate::microbatch::{gather, scatter};
use crate::pipeline::Pipeline;

pub struct GPipe<B: Backend> {
    backend: Arc<B>,
    partitions: Vec<Arc<dyn Partition<B::Tensor>>>,
    devices: Vec<Device>,
    config: GPipeConfig,
    training: bool,
    /// `[partition][chunk]`, created on first use.
    copy_streams: Vec<Vec<Stream>>,
}

impl<B: Backend> GPipe<B> {
    /// Wrap `partitions`. Devices come from `config.devices` when given and
    /// from each partition otherwise; configured devices must match where
    /// the partitions live. Starts in training mode.
    pub fn new(
        backend: Arc<B>,
        partitions: Vec<Arc<dyn Partition<B::Tensor>>>,
        config: GPipeConfig,
    ) -> Result<Self> {
        config.validate()?;
        if partitions.is_empty() {
            return Err(PipelineError::Config("at least one partition is required".into()));
        }

        let devices = match &config.devices {
            Some(_) => config.devices_for(partitions.len())?,
            None => partitions.iter().map(|p| p.device()).collect(),
        };
        for (i, (partition, device)) in partitions.iter().zip(&devices).enumerate() {
            if partition.device() != *device {
                return Err(PipelineError::Config(format!(
                    "partition {i} ({}) lives on {} but is configured for {device}",
                    partition.name(),
                    partition.device()
                )));
            }
        }

        Ok(Self {
            backend,
            partitions,
            devices,
            config,
            training: true,
            copy_streams: Vec::new(),
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn chunks(&self) -> usize {
        self.config.chunks
    }

    pub fn checkpoint(&self) -> CheckpointMode {
        self.config.checkpoint
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Switch between training and evaluation. Evaluation never checkpoints.
    pub fn train(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Checkpointed micro-batch prefix for a mini-batch split into `m`.
    pub fn checkpoint_stop(&self, m: usize) -> usize {
        if self.training {
            self.config.checkpoint.checkpoint_stop(m)
        } else {
            0
        }
    }

    fn ensure_copy_streams(&mut self) -> Result<()> {
        if !self.copy_streams.is_empty() {
            return Ok(());
        }
        let chunks = self.config.chunks;
        let mut streams = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            let row = (0..chunks)
                .map(|_| self.backend.new_stream(*device))
                .collect::<Result<Vec<_>>>()?;
            streams.push(row);
        }
        debug!(partitions = streams.len(), chunks, "created copy streams");
        self.copy_streams = streams;
        Ok(())
    }

    /// Per-partition copy streams, `[partition][chunk]`.
    pub fn copy_streams(&mut self) -> Result<&[Vec<Stream>]> {
        self.ensure_copy_streams()?;
        Ok(&self.copy_streams)
    }

    /// Run a mini-batch through every partition.
    ///
    /// Each input tensor is split along its batch dimension into up to
    /// `chunks` micro-batches; outputs are concatenated in the same order.
    pub fn forward(&mut self, inputs: &[B::Tensor]) -> Result<Vec<B::Tensor>> {
        let batches = scatter(&*self.backend, inputs, self.config.chunks)?;
        let m = batches.len();
        if m > self.config.chunks {
            return Err(PipelineError::Balance(format!(
                "backend split the mini-batch into {m} micro-batches, expected at most {}",
                self.config.chunks
            )));
        }

        self.ensure_copy_streams()?;
        let copy_streams: Vec<Vec<Stream>> =
            self.copy_streams.iter().map(|row| row[..m].to_vec()).collect();

        let mut pipeline = Pipeline::builder(
            Arc::clone(&self.backend),
            batches,
            self.partitions.clone(),
        )
        .devices(self.devices.clone())
        .copy_streams(copy_streams)
        .checkpoint_stop(self.checkpoint_stop(m))
        .worker_name_prefix(self.config.worker_name_prefix.clone())
        .build()?;

        pipeline.run()?;
        gather(&*self.backend, pipeline.batches())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Affine, HostBackend, HostTensor};

    fn model(backend: &Arc<HostBackend>) -> Vec<Arc<dyn Partition<HostTensor>>> {
        vec![
            Arc::new(Affine::new(Arc::clone(backend), "double", 2.0, 0.0)),
            Arc::new(Affine::new(Arc::clone(backend), "inc", 1.0, 1.0)),
        ]
    }

    fn config(chunks: usize, checkpoint: CheckpointMode) -> GPipeConfig {
        GPipeConfig {
            chunks,
            checkpoint,
            ..GPipeConfig::default()
        }
    }

    #[test]
    fn forward_matches_sequential() {
        let backend = Arc::new(HostBackend::new());
        let mut gpipe =
            GPipe::new(Arc::clone(&backend), model(&backend), config(3, CheckpointMode::Never)).unwrap();

        let x = backend.tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let out = gpipe.forward(&[x]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].values(), &[3.0, 5.0, 7.0, 9.0, 11.0]);
    }

    #[test]
    fn checkpoint_stop_follows_mode_and_training() {
        let backend = Arc::new(HostBackend::new());
        let mut gpipe =
            GPipe::new(Arc::clone(&backend), model(&backend), config(4, CheckpointMode::ExceptLast)).unwrap();
        assert_eq!(gpipe.checkpoint_stop(4), 3);
        assert_eq!(gpipe.checkpoint_stop(2), 1);

        gpipe.train(false);
        assert!(!gpipe.is_training());
        assert_eq!(gpipe.checkpoint_stop(4), 0);
    }

    #[test]
    fn training_checkpoints_all_but_last() {
        let backend = Arc::new(HostBackend::new());
        let mut gpipe =
            GPipe::new(Arc::clone(&backend), model(&backend), config(3, CheckpointMode::ExceptLast)).unwrap();

        let x = backend.tensor(vec![1.0, 2.0, 3.0]);
        let out = gpipe.forward(&[x]).unwrap();
        assert_eq!(out[0].values(), &[3.0, 5.0, 7.0]);

        // Two partitions, two checkpointed micro-batches each.
        assert_eq!(backend.tape().count_label("recompute"), 4);
        assert_eq!(backend.tape().count_label("checkpoint"), 4);
    }

    #[test]
    fn evaluation_never_checkpoints() {
        let backend = Arc::new(HostBackend::new());
        let mut gpipe =
            GPipe::new(Arc::clone(&backend), model(&backend), config(2, CheckpointMode::Always)).unwrap();
        gpipe.train(false);

        gpipe.forward(&[backend.tensor(vec![1.0, 2.0])]).unwrap();
        assert_eq!(backend.tape().count_label("recompute"), 0);
    }

    #[test]
    fn copy_streams_are_cached() {
        let backend = Arc::new(HostBackend::new());
        let mut gpipe =
            GPipe::new(Arc::clone(&backend), model(&backend), config(2, CheckpointMode::Never)).unwrap();

        let first = gpipe.copy_streams().unwrap().to_vec();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|row| row.len() == 2));
        assert!(first.iter().flatten().all(|s| !s.is_default()));

        gpipe.forward(&[backend.tensor(vec![1.0, 2.0])]).unwrap();
        assert_eq!(gpipe.copy_streams().unwrap(), first.as_slice());
    }

    #[test]
    fn short_mini_batch_uses_fewer_micro_batches() {
        let backend = Arc::new(HostBackend::new());
        let mut gpipe =
            GPipe::new(Arc::clone(&backend), model(&backend), config(4, CheckpointMode::Always)).unwrap();

        let out = gpipe.forward(&[backend.tensor(vec![1.0, 2.0])]).unwrap();
        assert_eq!(out[0].values(), &[3.0, 5.0]);
        assert_eq!(backend.tape().count_label("recompute"), 4);
    }

    #[test]
    fn construction_validates() {
        let backend = Arc::new(HostBackend::new());
        assert!(GPipe::new(Arc::clone(&backend), vec![], GPipeConfig::default()).is_err());
        assert!(GPipe::new(Arc::clone(&backend), model(&backend), config(0, CheckpointMode::Never)).is_err());

        let wrong_devices = GPipeConfig {
            devices: Some(vec![Device::Cpu]),
            ..GPipeConfig::default()
        };
        let err = GPipe::new(Arc::clone(&backend), model(&backend), wrong_devices).err().unwrap();
        assert!(matches!(err, PipelineError::Types(_)));
    }

    #[test]
    fn configured_devices_must_match_partitions() {
        let backend = Arc::new(HostBackend::new());
        let mismatched = GPipeConfig {
            devices: Some(vec![Device::Cpu, Device::Accelerator(0)]),
            ..GPipeConfig::default()
        };
        let err = GPipe::new(Arc::clone(&backend), model(&backend), mismatched).err().unwrap();
        assert!(matches!(&err, PipelineError::Config(msg) if msg.contains("partition 1")));

        let placed: Vec<Arc<dyn Partition<HostTensor>>> = vec![
            Arc::new(Affine::new(Arc::clone(&backend), "double", 2.0, 0.0)),
            Arc::new(Affine::new(Arc::clone(&backend), "inc", 1.0, 1.0).on(Device::Accelerator(0))),
        ];
        let matched = GPipeConfig {
            devices: Some(vec![Device::Cpu, Device::Accelerator(0)]),
            ..GPipeConfig::default()
        };
        let gpipe = GPipe::new(Arc::clone(&backend), placed, matched).unwrap();
        assert_eq!(gpipe.devices(), &[Device::Cpu, Device::Accelerator(0)]);
    }

    #[test]
    fn partition_failure_surfaces_from_forward() {
        let backend = Arc::new(HostBackend::new());
        let failing: Arc<dyn Partition<HostTensor>> = Arc::new(crate::backend::FnPartition::new(
            "boom",
            |_: &crate::batch::Batch<HostTensor>| -> anyhow::Result<crate::batch::Batch<HostTensor>> {
                anyhow::bail!("boom")
            },
        ));
        let mut gpipe = GPipe::new(
            Arc::clone(&backend),
            vec![failing],
            config(2, CheckpointMode::Never),
        )
        .unwrap();

        let err = gpipe.forward(&[backend.tensor(vec![1.0, 2.0])]).unwrap_err();
        assert!(matches!(err, PipelineError::Compute { partition: 0, micro_batch: 0, .. }));
    }
}
