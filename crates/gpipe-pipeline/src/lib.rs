//! `gpipe-pipeline`: pipeline-parallel micro-batch scheduling.
//!
//! This crate is a **scheduling layer**, not a compute layer. Tensors,
//! streams and the backward graph belong to an injected [`Backend`]; the
//! scheduler decides which partition runs which micro-batch in which clock
//! cycle, stitches the graph edges that keep backward ordering and stream
//! synchronisation correct, and fans the work out to one worker thread per
//! partition.
//!
//! # Architecture
//!
//! ```text
//!            cycle 0    cycle 1    cycle 2    cycle 3
//! ┌────────┐
//! │ part 0 │  (0,0)  ─▶  (0,1)  ─▶  (0,2)
//! ├────────┤     │          │          │
//! │ part 1 │     └──▶  (1,0)  ─▶  (1,1)  ─▶  (1,2)
//! └────────┘
//!   worker 0 / worker 1, copy streams between partitions
//! ```
//!
//! [`host`] is a CPU reference backend that records the backward graph on a
//! tape, so the ordering the scheduler builds can be executed and observed.

pub mod backend;
pub mod batch;
pub mod cell;
pub mod dependency;
pub mod error;
pub mod gpipe;
pub mod host;
pub mod microbatch;
pub mod pipeline;
pub mod schedule;
pub mod worker;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use backend::{Backend, Checkpoint, FnPartition, Partition};
pub use batch::Batch;
pub use cell::{CellGrid, CellState};
pub use dependency::{copy, depend, wait};
pub use error::{PipelineError, Result};
pub use gpipe::GPipe;
pub use microbatch::{gather, scatter};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use schedule::{clock_cycles, Cell, ClockCycles, Schedule};
pub use worker::{Outcome, Task, WorkerPool};
