//! Pipeline driver.
//!
//! Runs `m` micro-batches through `n` partitions following the wavefront
//! from [`clock_cycles`]. Every clock cycle has two phases:
//!
//! 1. **Fence** (driver only): for each cell `(i, j)`, make micro-batch
//!    `j - 1`'s backward wait for micro-batch `j`'s, and copy micro-batch
//!    `j` from partition `i - 1`'s copy stream onto partition `i`'s.
//! 2. **Compute**: submit one task per cell to the partition's worker, then
//!    collect the results in schedule order, sync each output onto its copy
//!    stream, finalize (checkpoint recompute) and store it back.
//!
//! ```text
//!   copy_streams[i-1][j] ──copy──▶ copy_streams[i][j] ──wait──▶ compute(i)
//!                                                                 │
//!   copy_streams[i][j]  ◀─────────────── wait ────────────────────┘
//! ```
//!
//! Results are applied in schedule order, so the contents of `batches` do
//! not depend on which worker finishes first.

use std::sync::Arc;

use gpipe_types::{Device, Stream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, Partition};
use crate::batch::Batch;
use crate::cell::{CellGrid, CellState};
use crate::dependency::{copy, depend, wait};
use crate::error::{PipelineError, Result};
use crate::schedule::{clock_cycles, Cell};
use crate::worker::{ComputeFailure, Outcome, Task, WorkerPool};

pub const DEFAULT_WORKER_PREFIX: &str = "gpipe-worker";

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct PipelineBuilder<B: Backend> {
    backend: Arc<B>,
    batches: Vec<Batch<B::Tensor>>,
    partitions: Vec<Arc<dyn Partition<B::Tensor>>>,
    devices: Option<Vec<Device>>,
    copy_streams: Option<Vec<Vec<Stream>>>,
    checkpoint_stop: usize,
    worker_name_prefix: String,
}

impl<B: Backend> PipelineBuilder<B> {
    /// Devices, one per partition. Defaults to each partition's own device.
    pub fn devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Copy streams indexed `[partition][micro_batch]`. Defaults to each
    /// device's current stream for every micro-batch.
    pub fn copy_streams(mut self, copy_streams: Vec<Vec<Stream>>) -> Self {
        self.copy_streams = Some(copy_streams);
        self
    }

    /// Micro-batches with index `< checkpoint_stop` run under checkpointing.
    pub fn checkpoint_stop(mut self, checkpoint_stop: usize) -> Self {
        self.checkpoint_stop = checkpoint_stop;
        self
    }

    pub fn worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    /// Validate the configuration and build the pipeline.
    pub fn build(self) -> Result<Pipeline<B>> {
        let n = self.partitions.len();
        let m = self.batches.len();

        let devices = match self.devices {
            Some(devices) => {
                if devices.len() != n {
                    return Err(PipelineError::Config(format!(
                        "{} devices for {n} partitions",
                        devices.len()
                    )));
                }
                devices
            }
            None => self.partitions.iter().map(|p| p.device()).collect(),
        };

        for (i, (partition, device)) in self.partitions.iter().zip(&devices).enumerate() {
            if partition.device() != *device {
                return Err(PipelineError::Config(format!(
                    "partition {i} ({}) lives on {} but is assigned to {device}",
                    partition.name(),
                    partition.device()
                )));
            }
        }

        let copy_streams = match self.copy_streams {
            Some(streams) => {
                if streams.len() != n {
                    return Err(PipelineError::Config(format!(
                        "copy streams have {} rows for {n} partitions",
                        streams.len()
                    )));
                }
                for (i, row) in streams.iter().enumerate() {
                    if row.len() != m {
                        return Err(PipelineError::Config(format!(
                            "copy streams row {i} has {} entries for {m} micro-batches",
                            row.len()
                        )));
                    }
                    if let Some(s) = row.iter().find(|s| s.device != devices[i]) {
                        return Err(PipelineError::Config(format!(
                            "copy stream {s} for partition {i} is not on {}",
                            devices[i]
                        )));
                    }
                }
                streams
            }
            None => devices
                .iter()
                .map(|d| vec![self.backend.current_stream(*d); m])
                .collect(),
        };

        if self.checkpoint_stop > m {
            return Err(PipelineError::Config(format!(
                "checkpoint_stop {} exceeds {m} micro-batches",
                self.checkpoint_stop
            )));
        }

        if n > 0 {
            if let Some(j) = self.batches.iter().position(Batch::is_empty) {
                return Err(PipelineError::Config(format!("micro-batch {j} has no tensors")));
            }
        }

        if self.worker_name_prefix.is_empty() {
            return Err(PipelineError::Config("worker name prefix must not be empty".into()));
        }

        Ok(Pipeline {
            backend: self.backend,
            batches: self.batches,
            partitions: self.partitions,
            devices,
            copy_streams,
            checkpoint_stop: self.checkpoint_stop,
            worker_name_prefix: self.worker_name_prefix,
        })
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct Pipeline<B: Backend> {
    backend: Arc<B>,
    batches: Vec<Batch<B::Tensor>>,
    partitions: Vec<Arc<dyn Partition<B::Tensor>>>,
    devices: Vec<Device>,
    copy_streams: Vec<Vec<Stream>>,
    checkpoint_stop: usize,
    worker_name_prefix: String,
}

impl<B: Backend> Pipeline<B> {
    pub fn builder(
        backend: Arc<B>,
        batches: Vec<Batch<B::Tensor>>,
        partitions: Vec<Arc<dyn Partition<B::Tensor>>>,
    ) -> PipelineBuilder<B> {
        PipelineBuilder {
            backend,
            batches,
            partitions,
            devices: None,
            copy_streams: None,
            checkpoint_stop: 0,
            worker_name_prefix: DEFAULT_WORKER_PREFIX.to_string(),
        }
    }

    pub fn batches(&self) -> &[Batch<B::Tensor>] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<Batch<B::Tensor>> {
        self.batches
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn copy_streams(&self) -> &[Vec<Stream>] {
        &self.copy_streams
    }

    pub fn checkpoint_stop(&self) -> usize {
        self.checkpoint_stop
    }

    /// Run every micro-batch through every partition.
    ///
    /// On success `batches()[j]` holds the last partition's output for
    /// micro-batch `j`. On a worker failure the run stops at the end of the
    /// failing clock cycle and returns the first failure in schedule order;
    /// micro-batches finished before it keep their results.
    ///
    /// Blocks the calling thread on worker results; do not call from inside
    /// an async runtime worker.
    pub fn run(&mut self) -> Result<()> {
        let n = self.partitions.len();
        let m = self.batches.len();
        if n == 0 || m == 0 {
            return Ok(());
        }

        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            partitions = n,
            micro_batches = m,
            checkpoint_stop = self.checkpoint_stop,
            "starting pipeline run"
        );

        let mut workers =
            WorkerPool::spawn(Arc::clone(&self.backend), n, &self.worker_name_prefix)?;
        let mut cells = CellGrid::new(n, m);

        for (k, schedule) in clock_cycles(n, m).enumerate() {
            debug!(%run_id, cycle = k, cells = schedule.len(), "clock cycle");

            self.fence(&schedule, &mut cells)?;
            if let Some((failure, suppressed)) = self.compute(&schedule, &mut workers, &mut cells)? {
                workers.shutdown();
                warn!(
                    %run_id,
                    partition = failure.partition,
                    micro_batch = failure.micro_batch,
                    suppressed,
                    "pipeline run failed"
                );
                return Err(PipelineError::Compute {
                    partition: failure.partition,
                    micro_batch: failure.micro_batch,
                    suppressed,
                    source: failure.error,
                });
            }
        }

        workers.shutdown();
        debug_assert!(cells.is_drained());
        info!(%run_id, "pipeline run finished");
        Ok(())
    }

    fn fence(&mut self, schedule: &[Cell], cells: &mut CellGrid) -> Result<()> {
        for &cell in schedule {
            let Cell { partition: i, micro_batch: j } = cell;

            if j > 0 {
                let (done, rest) = self.batches.split_at_mut(j);
                depend(&*self.backend, &mut done[j - 1], &mut rest[0])?;
            }

            if i > 0 {
                let prev = self.copy_streams[i - 1][j];
                let next = self.copy_streams[i][j];
                copy(&*self.backend, &mut self.batches[j], prev, next)?;
            }

            cells.advance(cell, CellState::Fenced)?;
        }
        Ok(())
    }

    /// Returns the first failure of the cycle and how many later failures
    /// were absorbed, if any cell failed.
    fn compute(
        &mut self,
        schedule: &[Cell],
        workers: &mut WorkerPool<B::Tensor>,
        cells: &mut CellGrid,
    ) -> Result<Option<(ComputeFailure, usize)>> {
        let n = self.partitions.len();

        for &cell in schedule {
            let Cell { partition: i, micro_batch: j } = cell;
            let stream = self.backend.current_stream(self.devices[i]);

            if i > 0 {
                wait(&*self.backend, &mut self.batches[j], self.copy_streams[i][j], stream)?;
            }

            let partition = Arc::clone(&self.partitions[i]);
            let input = self.batches[j].clone();

            let task = if j < self.checkpoint_stop {
                let chk = self.backend.checkpointing(partition, input);
                let recompute = Arc::clone(&chk);
                Task::new(i, j, stream, move || chk.checkpoint())
                    .with_finalize(move |batch: &mut Batch<B::Tensor>| recompute.recompute(batch))
            } else {
                Task::new(i, j, stream, move || input.call(&*partition))
            };

            debug!(cell = %cell, checkpoint = task.has_finalize(), "submitting task");
            workers.submit(i, task)?;
            cells.advance(cell, CellState::Submitted)?;
        }

        let mut failure: Option<ComputeFailure> = None;
        let mut suppressed = 0;

        for &cell in schedule {
            let Cell { partition: i, micro_batch: j } = cell;

            match workers.collect(i)? {
                Outcome::Failed(f) => {
                    cells.advance(cell, CellState::Failed)?;
                    if failure.is_none() {
                        failure = Some(f);
                    } else {
                        suppressed += 1;
                        warn!(cell = %cell, error = %f.error, "absorbing secondary failure");
                    }
                }
                Outcome::Completed { mut task, mut batch } => {
                    cells.advance(cell, CellState::Completed)?;
                    if failure.is_some() {
                        debug!(cell = %cell, "discarding result after failure");
                        continue;
                    }

                    if i + 1 < n {
                        wait(&*self.backend, &mut batch, task.stream, self.copy_streams[i][j])?;
                    }

                    task.finalize(&*self.backend, &mut batch).map_err(|e| match e {
                        PipelineError::Finalize(_) => e,
                        other => PipelineError::Finalize(format!("cell {cell}: {other}")),
                    })?;

                    self.batches[j] = batch;
                }
            }
        }

        Ok(failure.map(|f| (f, suppressed)))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Affine, HostBackend, HostTensor};

    fn affine(backend: &Arc<HostBackend>, scale: f32, shift: f32) -> Arc<dyn Partition<HostTensor>> {
        Arc::new(Affine::new(Arc::clone(backend), "affine", scale, shift))
    }

    fn inputs(backend: &HostBackend, values: &[f32]) -> Vec<Batch<HostTensor>> {
        values.iter().map(|v| Batch::atomic(backend.tensor(vec![*v]))).collect()
    }

    fn outputs(pipeline: &Pipeline<HostBackend>) -> Vec<Vec<f32>> {
        pipeline.batches().iter().map(|b| b[0].to_vec()).collect()
    }

    #[test]
    fn default_copy_streams_repeat_current_stream() {
        let backend = Arc::new(HostBackend::new());
        let pipeline = Pipeline::builder(
            Arc::clone(&backend),
            inputs(&backend, &[0.0, 1.0]),
            vec![affine(&backend, 1.0, 1.0)],
        )
        .build()
        .unwrap();

        assert_eq!(pipeline.devices(), &[Device::Cpu]);
        assert_eq!(pipeline.copy_streams(), &[vec![Stream::default_for(Device::Cpu); 2]]);
    }

    #[test]
    fn device_count_mismatch_rejected() {
        let backend = Arc::new(HostBackend::new());
        let err = Pipeline::builder(
            Arc::clone(&backend),
            inputs(&backend, &[0.0]),
            vec![affine(&backend, 1.0, 0.0)],
        )
        .devices(vec![Device::Cpu, Device::Cpu])
        .build()
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn partition_device_must_match() {
        let backend = Arc::new(HostBackend::new());
        let p: Arc<dyn Partition<HostTensor>> =
            Arc::new(Affine::new(Arc::clone(&backend), "p", 1.0, 0.0).on(Device::Accelerator(0)));
        let result = Pipeline::builder(Arc::clone(&backend), inputs(&backend, &[0.0]), vec![p])
            .devices(vec![Device::Cpu])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn copy_stream_shape_and_device_checked() {
        let backend = Arc::new(HostBackend::new());
        let cpu = Stream::default_for(Device::Cpu);
        let accel = Stream::default_for(Device::Accelerator(0));

        let short_row = Pipeline::builder(
            Arc::clone(&backend),
            inputs(&backend, &[0.0, 1.0]),
            vec![affine(&backend, 1.0, 0.0)],
        )
        .copy_streams(vec![vec![cpu]])
        .build();
        assert!(short_row.is_err());

        let wrong_device = Pipeline::builder(
            Arc::clone(&backend),
            inputs(&backend, &[0.0]),
            vec![affine(&backend, 1.0, 0.0)],
        )
        .copy_streams(vec![vec![accel]])
        .build();
        assert!(wrong_device.is_err());
    }

    #[test]
    fn checkpoint_stop_bounds() {
        let backend = Arc::new(HostBackend::new());
        let build = |stop| {
            Pipeline::builder(
                Arc::clone(&backend),
                inputs(&backend, &[0.0, 1.0]),
                vec![affine(&backend, 1.0, 0.0)],
            )
            .checkpoint_stop(stop)
            .build()
        };
        assert!(build(2).is_ok());
        assert!(build(3).is_err());
    }

    #[test]
    fn empty_batch_rejected() {
        let backend = Arc::new(HostBackend::new());
        let result = Pipeline::builder(
            Arc::clone(&backend),
            vec![Batch::new(vec![])],
            vec![affine(&backend, 1.0, 0.0)],
        )
        .build();
        assert!(result.is_err());
    }

    #[test]
    fn empty_pipeline_is_a_no_op() {
        let backend = Arc::new(HostBackend::new());
        let mut no_batches =
            Pipeline::builder(Arc::clone(&backend), vec![], vec![affine(&backend, 1.0, 0.0)])
                .build()
                .unwrap();
        no_batches.run().unwrap();

        let mut no_partitions =
            Pipeline::builder(Arc::clone(&backend), inputs(&backend, &[3.0]), vec![])
                .build()
                .unwrap();
        no_partitions.run().unwrap();
        assert_eq!(outputs(&no_partitions), vec![vec![3.0]]);
        assert!(backend.events().is_empty());
    }

    #[test]
    fn fence_copies_once_per_downstream_cell() {
        let backend = Arc::new(HostBackend::new());
        let partitions = vec![affine(&backend, 1.0, 1.0), affine(&backend, 1.0, 1.0), affine(&backend, 1.0, 1.0)];
        let mut pipeline = Pipeline::builder(Arc::clone(&backend), inputs(&backend, &[0.0, 0.0]), partitions)
            .build()
            .unwrap();
        pipeline.run().unwrap();

        assert_eq!(outputs(&pipeline), vec![vec![3.0], vec![3.0]]);
        // (n - 1) * m copies; one `depend` per cell with j > 0.
        assert_eq!(backend.tape().count_label("copy"), 4);
        assert_eq!(backend.tape().count_label("fork"), 3);
        assert_eq!(backend.tape().count_label("join"), 3);
    }

    #[test]
    fn explicit_copy_streams_are_used() {
        let backend = Arc::new(HostBackend::new());
        let dev0 = Device::Cpu;
        let dev1 = Device::Accelerator(0);
        let partitions: Vec<Arc<dyn Partition<HostTensor>>> = vec![
            Arc::new(Affine::new(Arc::clone(&backend), "p0", 1.0, 1.0).on(dev0)),
            Arc::new(Affine::new(Arc::clone(&backend), "p1", 2.0, 0.0).on(dev1)),
        ];
        let streams = vec![
            vec![backend.new_stream(dev0).unwrap()],
            vec![backend.new_stream(dev1).unwrap()],
        ];

        let mut pipeline = Pipeline::builder(Arc::clone(&backend), inputs(&backend, &[1.0]), partitions)
            .copy_streams(streams.clone())
            .build()
            .unwrap();
        pipeline.run().unwrap();

        assert_eq!(outputs(&pipeline), vec![vec![4.0]]);
        assert_eq!(pipeline.batches()[0][0].device(), dev1);
        let copies: Vec<_> = backend
            .events()
            .into_iter()
            .filter(|e| e.kind == crate::host::EventKind::Copy)
            .collect();
        assert_eq!(copies.len(), 1);
        assert_eq!((copies[0].from, copies[0].to), (streams[0][0], streams[1][0]));
    }
}
