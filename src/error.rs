//! Error type shared by the coordinator, the storage backends and the gather layer.
use thiserror::Error;

use crate::layout::Role;

#[derive(Error, Debug)]
pub enum Error {
    #[error("a write session needs at least one process")]
    NoProcesses,
    #[error("rank {rank} is outside of a session with {nprocs} processes")]
    InvalidRank { rank: usize, nprocs: usize },
    #[error("rank {rank}: round queried before a metric was configured")]
    NotConfigured { rank: usize },
    #[error("rank {rank} opened the report as {role:?} and cannot {op}")]
    ReadOnlyRole { rank: usize, role: Role, op: &'static str },
    #[error("rank {rank}: {op} is reserved for the master rank")]
    MasterOnly { rank: usize, op: &'static str },
    #[error("gather failed: {0}")]
    Gather(String),
    #[error("corrupt report data: {0}")]
    CorruptReport(String),
    #[error("invalid value distribution: {0}")]
    Distribution(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
