//! Collective value gathering.
//!
//! The coordinator itself never communicates. Once per round the driver
//! gathers every rank's contribution for the current cnode onto the designated
//! writer, which also acts as the barrier keeping all ranks in step.
use std::sync::mpsc::{self, Receiver, Sender};
use mpi::datatype::PartitionMut;
use mpi::traits::*;
use mpi::Count;

use crate::error::{Error, Result};

/// Gather capability used by the write driver.
pub trait ValueGather {
    /// Rank of this process.
    fn rank(&self) -> usize;

    /// Number of processes taking part.
    fn size(&self) -> usize;

    /// Gather `local` from every rank onto `root`.
    ///
    /// The root gets the contributions concatenated in rank order, every other
    /// rank gets `None`.
    fn gather(&self, root: usize, local: &[f64]) -> Result<Option<Vec<f64>>>;
}

/// Gather over an MPI communicator.
pub struct MpiGather<'a, C: Communicator> {
    comm: &'a C,
}

impl<'a, C: Communicator> MpiGather<'a, C> {
    pub fn new(comm: &'a C) -> MpiGather<'a, C> {
        MpiGather { comm }
    }
}

impl<'a, C: Communicator> ValueGather for MpiGather<'a, C> {
    fn rank(&self) -> usize {
        self.comm.rank().try_into().expect("MPI rank is never negative")
    }

    fn size(&self) -> usize {
        self.comm.size().try_into().expect("MPI size is never negative")
    }

    fn gather(&self, root: usize, local: &[f64]) -> Result<Option<Vec<f64>>> {
        let root_rank: mpi::Rank = root
            .try_into()
            .map_err(|_| Error::Gather(format!("root {} does not fit an MPI rank", root)))?;
        let local_count: Count = local
            .len()
            .try_into()
            .map_err(|_| Error::Gather(format!("{} values do not fit an MPI count", local.len())))?;
        let root_process = self.comm.process_at_rank(root_rank);

        if self.rank() != root {
            root_process.gather_into(&local_count);
            root_process.gather_varcount_into(local);
            return Ok(None);
        }

        let mut counts: Vec<Count> = vec![0; self.size()];
        root_process.gather_into_root(&local_count, &mut counts[..]);
        let disps: Vec<Count> = counts
            .iter()
            .scan(0, |state, &count| {
                let disp = *state;
                *state += count;
                Some(disp)
            })
            .collect();
        let total: usize = counts
            .iter()
            .sum::<Count>()
            .try_into()
            .map_err(|_| Error::Gather("negative gather count".to_string()))?;
        let mut values = vec![0.0; total];
        let mut partition = PartitionMut::new(&mut values[..], &counts[..], &disps[..]);
        root_process.gather_varcount_into_root(local, &mut partition);
        Ok(Some(values))
    }
}

/// In-process gather between threads, one per simulated rank.
///
/// Every (sender, root) pair has its own channel, so rows of consecutive rounds
/// can not be mixed up even though sends never block.
pub struct ChannelGather {
    rank: usize,
    size: usize,
    /// Indexed by root.
    senders: Vec<Sender<Vec<f64>>>,
    /// Indexed by sender.
    receivers: Vec<Receiver<Vec<f64>>>,
}

/// Create the gather endpoints of `size` simulated ranks.
pub fn channel_group(size: usize) -> Vec<ChannelGather> {
    let mut senders: Vec<Vec<Sender<Vec<f64>>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
    let mut receivers: Vec<Vec<Receiver<Vec<f64>>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
    for root in 0..size {
        for sender in 0..size {
            let (tx, rx) = mpsc::channel();
            senders[sender].push(tx);
            receivers[root].push(rx);
        }
    }
    senders
        .into_iter()
        .zip(receivers)
        .enumerate()
        .map(|(rank, (senders, receivers))| ChannelGather {
            rank,
            size,
            senders,
            receivers,
        })
        .collect()
}

impl ValueGather for ChannelGather {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn gather(&self, root: usize, local: &[f64]) -> Result<Option<Vec<f64>>> {
        if root >= self.size {
            return Err(Error::Gather(format!("root {} outside of {} ranks", root, self.size)));
        }
        if self.rank != root {
            self.senders[root]
                .send(local.to_vec())
                .map_err(|_| Error::Gather(format!("root {} hung up", root)))?;
            return Ok(None);
        }
        let mut values = vec![];
        for (sender, receiver) in self.receivers.iter().enumerate() {
            if sender == self.rank {
                values.extend_from_slice(local);
            } else {
                let row = receiver
                    .recv()
                    .map_err(|_| Error::Gather(format!("rank {} hung up", sender)))?;
                values.extend(row);
            }
        }
        Ok(Some(values))
    }
}
