use std::fmt;

use crate::error::{PipelineError, Result};
use crate::schedule::Cell;

// ── Cell State Machine ───────────────────────────────────────────────────────

/// Pending → Fenced → Submitted → Completed | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// Not yet reached by the schedule.
    Pending,
    /// Backward dependency and cross-device copy inserted.
    Fenced,
    /// Task queued on the partition's worker.
    Submitted,
    /// Result collected.
    Completed,
    /// The worker reported a failure.
    Failed,
}

impl CellState {
    fn can_advance_to(self, next: CellState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Fenced)
                | (Self::Fenced, Self::Submitted)
                | (Self::Submitted, Self::Completed)
                | (Self::Submitted, Self::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for CellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending   => write!(f, "Pending"),
            Self::Fenced    => write!(f, "Fenced"),
            Self::Submitted => write!(f, "Submitted"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed    => write!(f, "Failed"),
        }
    }
}

// ── Cell Grid ────────────────────────────────────────────────────────────────

/// State of every `(partition, micro-batch)` cell of one run.
#[derive(Debug)]
pub struct CellGrid {
    num_partitions: usize,
    num_micro_batches: usize,
    states: Vec<CellState>,
}

impl CellGrid {
    pub fn new(num_partitions: usize, num_micro_batches: usize) -> Self {
        Self {
            num_partitions,
            num_micro_batches,
            states: vec![CellState::Pending; num_partitions * num_micro_batches],
        }
    }

    fn slot(&self, cell: Cell) -> Result<usize> {
        if cell.partition >= self.num_partitions || cell.micro_batch >= self.num_micro_batches {
            return Err(PipelineError::Config(format!(
                "cell {cell} outside {}×{} grid",
                self.num_partitions, self.num_micro_batches
            )));
        }
        Ok(cell.partition * self.num_micro_batches + cell.micro_batch)
    }

    pub fn state(&self, cell: Cell) -> Result<CellState> {
        Ok(self.states[self.slot(cell)?])
    }

    /// Move `cell` to `next`. Skipping a state or re-entering a cell fails.
    pub fn advance(&mut self, cell: Cell, next: CellState) -> Result<()> {
        let slot = self.slot(cell)?;
        let current = self.states[slot];
        if !current.can_advance_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: format!("{cell} {current}"),
                to: next.to_string(),
            });
        }
        self.states[slot] = next;
        Ok(())
    }

    pub fn count(&self, state: CellState) -> usize {
        self.states.iter().filter(|s| **s == state).count()
    }

    /// True once every cell reached `Completed` or `Failed`.
    pub fn is_drained(&self) -> bool {
        self.states.iter().all(|s| s.is_terminal())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_happy_path() {
        let mut grid = CellGrid::new(2, 2);
        let cell = Cell::new(1, 0);
        assert_eq!(grid.state(cell).unwrap(), CellState::Pending);

        grid.advance(cell, CellState::Fenced).unwrap();
        grid.advance(cell, CellState::Submitted).unwrap();
        grid.advance(cell, CellState::Completed).unwrap();
        assert_eq!(grid.state(cell).unwrap(), CellState::Completed);
        assert_eq!(grid.count(CellState::Pending), 3);
        assert!(!grid.is_drained());
    }

    #[test]
    fn re_entry_rejected() {
        let mut grid = CellGrid::new(1, 1);
        let cell = Cell::new(0, 0);
        grid.advance(cell, CellState::Fenced).unwrap();
        grid.advance(cell, CellState::Submitted).unwrap();
        grid.advance(cell, CellState::Failed).unwrap();
        assert!(grid.is_drained());

        let err = grid.advance(cell, CellState::Fenced).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    }

    #[test]
    fn skipping_a_state_rejected() {
        let mut grid = CellGrid::new(1, 1);
        assert!(grid.advance(Cell::new(0, 0), CellState::Submitted).is_err());
    }

    #[test]
    fn out_of_grid_rejected() {
        let grid = CellGrid::new(2, 3);
        assert!(grid.state(Cell::new(2, 0)).is_err());
        assert!(grid.state(Cell::new(0, 3)).is_err());
    }
}
