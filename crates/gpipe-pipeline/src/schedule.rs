//! Diagonal wavefront (GPipe) clock-cycle schedule.
//!
//! ```text
//! Cycle →  0    1    2    3    4    5
//! P0:    [m0] [m1] [m2] [m3]
//! P1:         [m0] [m1] [m2] [m3]
//! P2:              [m0] [m1] [m2] [m3]
//!
//! Cycle k runs every cell (i, k - i) that falls inside the grid.
//! Pipeline bubble = n-1 cycles at start + end
//! Efficiency = m / (m + n - 1)
//! ```

use std::fmt;
use std::iter::FusedIterator;

/// One cell of the schedule: run partition `partition` on micro-batch
/// `micro_batch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cell {
    pub partition: usize,
    pub micro_batch: usize,
}

impl Cell {
    pub fn new(partition: usize, micro_batch: usize) -> Self {
        Self { partition, micro_batch }
    }

    /// The clock cycle this cell runs at.
    pub fn cycle(&self) -> usize {
        self.partition + self.micro_batch
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.partition, self.micro_batch)
    }
}

// ── Clock cycles ─────────────────────────────────────────────────────────────

/// Iterator over the clock cycles of an `n × m` wavefront.
///
/// Yields `n + m - 1` cycles (none if either side is zero). Within a cycle
/// cells are ordered by ascending partition index.
#[derive(Debug, Clone)]
pub struct ClockCycles {
    num_partitions: usize,
    num_micro_batches: usize,
    next: usize,
    total: usize,
}

/// Enumerate the clock cycles for `num_partitions` partitions and
/// `num_micro_batches` micro-batches.
pub fn clock_cycles(num_partitions: usize, num_micro_batches: usize) -> ClockCycles {
    let total = if num_partitions == 0 || num_micro_batches == 0 {
        0
    } else {
        num_partitions + num_micro_batches - 1
    };
    ClockCycles {
        num_partitions,
        num_micro_batches,
        next: 0,
        total,
    }
}

impl ClockCycles {
    /// Cells of cycle `k`, or an empty list past the end.
    pub fn cells_at(&self, k: usize) -> Vec<Cell> {
        if k >= self.total {
            return Vec::new();
        }
        let lo = (k + 1).saturating_sub(self.num_micro_batches);
        let hi = k.min(self.num_partitions - 1);
        (lo..=hi).map(|i| Cell::new(i, k - i)).collect()
    }

    pub fn total_cycles(&self) -> usize {
        self.total
    }
}

impl Iterator for ClockCycles {
    type Item = Vec<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let cells = self.cells_at(self.next);
        self.next += 1;
        Some(cells)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ClockCycles {}
impl FusedIterator for ClockCycles {}

// ── Schedule ─────────────────────────────────────────────────────────────────

/// The materialized wavefront: every cell in execution order.
#[derive(Debug, Clone)]
pub struct Schedule {
    num_partitions: usize,
    num_micro_batches: usize,
    cycles: Vec<Vec<Cell>>,
}

impl Schedule {
    pub fn new(num_partitions: usize, num_micro_batches: usize) -> Self {
        Self {
            num_partitions,
            num_micro_batches,
            cycles: clock_cycles(num_partitions, num_micro_batches).collect(),
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn num_micro_batches(&self) -> usize {
        self.num_micro_batches
    }

    pub fn cycles(&self) -> &[Vec<Cell>] {
        &self.cycles
    }

    pub fn total_cycles(&self) -> usize {
        self.cycles.len()
    }

    /// All cells in schedule order (cycle, then partition).
    pub fn cells(&self) -> impl Iterator<Item = Cell> + '_ {
        self.cycles.iter().flatten().copied()
    }

    /// All cells assigned to one partition, in cycle order.
    pub fn cells_for_partition(&self, partition: usize) -> Vec<Cell> {
        self.cells().filter(|c| c.partition == partition).collect()
    }

    /// Fraction of partition-cycles doing useful work: `m / (m + n - 1)`.
    pub fn efficiency(&self) -> f64 {
        let total = self.total_cycles() as f64;
        if total == 0.0 {
            0.0
        } else {
            self.num_micro_batches as f64 / total
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
