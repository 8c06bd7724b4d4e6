//! Distributed writer coordination for cube performance reports.
//!
//! All ranks of a parallel program produce one report together. Only a strided
//! subset of ranks persists data, and the cnodes (call paths) of each metric are
//! round-robined across them. [`coordinator::WriteCoordinator`] decides, round by
//! round and without any messages of its own, which cnode is gathered, which
//! rank writes it and when a batch is complete.
pub mod c_api;
pub mod comm;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod layout;
pub mod storage;
pub mod synthetic;

pub use coordinator::WriteCoordinator;
pub use error::{Error, Result};
pub use layout::{Role, WriterConstraints, WriterLayout};
pub use storage::{ReportIdentity, ReportStorage, StorageFactory};

/// Id of a call path (cnode) within a metric.
pub type CnodeId = u64;

/// Id of a metric within a report.
pub type MetricId = u32;

/// Integer division rounding up, with `ceil_div(n, 0) == 0`.
pub fn ceil_div(n: usize, d: usize) -> usize {
    if d == 0 {
        0
    } else {
        n.div_ceil(d)
    }
}

/// Return a compact string for a list of ranks, e.g. `0,3,6`.
pub fn format_ranks(ranks: &[usize]) -> String {
    let mut s = String::new();
    for (i, rank) in ranks.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        s.push_str(&format!("{}", rank));
    }
    s
}
