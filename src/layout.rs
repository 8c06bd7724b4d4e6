//! Writer subset selection.
//!
//! Only every `step`-th rank persists data. The number of writers is derived
//! from the stride rather than the other way around, so the pair is always
//! consistent for integer stride spacing.
use serde::{Deserialize, Serialize};

use crate::ceil_div;
use crate::error::{Error, Result};

/// Role a rank opens the report storage in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Rank 0. Owns report metadata and the index, and writes data like any writer.
    Master,
    /// Stride-eligible rank that persists the rows assigned to it.
    Writer,
    /// Only takes part in the collective gathers.
    Slave,
}

/// Constraints imposed by the storage on the writer count.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterConstraints {
    /// Compressed values can only be written by a single rank.
    pub compression: bool,
    /// The storage layout itself mandates a single writer.
    pub single_writer: bool,
}

/// Resolved writer configuration of a write session.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriterLayout {
    /// Number of ranks taking part in the session.
    pub nprocs: usize,
    /// Effective number of writers, `nprocs / step`.
    pub nwriters: usize,
    /// Rank distance between consecutive writers.
    pub step: usize,
}

impl WriterLayout {
    /// Normalize a requested writer count.
    ///
    /// A request of 0 means 1, the constraints can force a single writer and
    /// anything above `nprocs` is clamped. None of these adjustments is an error.
    pub fn resolve(nprocs: usize, requested: usize, constraints: WriterConstraints) -> Result<WriterLayout> {
        if nprocs == 0 {
            return Err(Error::NoProcesses);
        }
        let mut writers = requested.max(1);
        if constraints.compression || constraints.single_writer {
            writers = 1;
        }
        let writers = writers.min(nprocs);
        let step = ceil_div(nprocs, writers);
        let layout = WriterLayout {
            nprocs,
            nwriters: nprocs / step,
            step,
        };
        if layout.nwriters != requested {
            tracing::debug!(
                requested,
                nwriters = layout.nwriters,
                step = layout.step,
                compression = constraints.compression,
                single_writer = constraints.single_writer,
                "normalized writer count"
            );
        }
        Ok(layout)
    }

    /// Whether `rank` passes the stride test.
    pub fn is_writer(&self, rank: usize) -> bool {
        rank % self.step == 0
    }

    /// Role of `rank` in this layout.
    pub fn role(&self, rank: usize) -> Role {
        if rank == 0 {
            Role::Master
        } else if self.is_writer(rank) {
            Role::Writer
        } else {
            Role::Slave
        }
    }

    /// All stride-eligible ranks.
    pub fn writer_ranks(&self) -> impl Iterator<Item = usize> {
        (0..self.nprocs).step_by(self.step)
    }

    /// Check that `rank` belongs to the session.
    pub fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.nprocs {
            return Err(Error::InvalidRank { rank, nprocs: self.nprocs });
        }
        Ok(())
    }
}
