//! Check the coordinated write across real MPI ranks.
//!
//! Run with e.g. `mpirun -n 8 target/debug/mpi_coordinated_write`.
use std::collections::BTreeSet;
use mpi::traits::*;
use mpi::topology::Color;
use cube_writer::comm::{MpiGather, ValueGather};
use cube_writer::driver::write_report;
use cube_writer::storage::file::{read_report, FileStorageFactory};
use cube_writer::synthetic::{self, ProfileOptions, ValueDistribution};
use cube_writer::{CnodeId, ReportIdentity, WriteCoordinator};

#[derive(Debug)]
struct MPITestError(String);

/// Return an `MPITestError` from the enclosing function when `$predicate` is false.
macro_rules! mpi_test_assert {
    ($predicate:expr) => {
        if !($predicate) {
            return Err(MPITestError(format!("check failed: {}", stringify!($predicate))));
        }
    };
}

/// Like `mpi_test_assert!`, but compares two values and reports both.
macro_rules! mpi_test_assert_eq {
    ($left:expr, $right:expr) => {{
        let (left, right) = (&$left, &$right);
        if left != right {
            return Err(MPITestError(format!(
                "{} = {:?} differs from {} = {:?}",
                stringify!($left),
                left,
                stringify!($right),
                right
            )));
        }
    }};
}

/// Write a report over `comm` and verify it from rank 0 of that communicator.
fn write_and_check<C: Communicator>(
    comm: &C,
    name: &str,
    writers: usize,
    compression: bool,
    opts: &ProfileOptions,
) -> Result<(), MPITestError> {
    let gather = MpiGather::new(comm);
    let rank = gather.rank();
    let size = gather.size();
    let dir = std::env::temp_dir().join("cube-writer-mpi-test");
    // Data files of earlier runs may still be in `dir`, only the index decides what is read
    let identity = ReportIdentity::new(&dir, name);

    let mut coord = WriteCoordinator::create(rank, size, writers, &identity, compression, &FileStorageFactory)
        .map_err(|err| MPITestError(format!("create: {}", err)))?;
    let layout = *coord.layout();
    let distr = ValueDistribution::new(opts.mean, opts.cv).map_err(|err| MPITestError(err.to_string()))?;
    let stats = write_report(&mut coord, &gather, &opts.metric_defs(), |metric, cnode| {
        Ok(synthetic::local_row(opts, &distr, metric.id, cnode, rank))
    })
    .map_err(|err| MPITestError(format!("write: {}", err)))?;
    coord.finalize().map_err(|err| MPITestError(format!("finalize: {}", err)))?;
    mpi_test_assert_eq!(stats.rounds, opts.metrics.len() * opts.cnodes);
    if !layout.is_writer(rank) {
        mpi_test_assert_eq!(stats.rows_written, 0);
    }
    comm.barrier();

    if rank == 0 {
        let contents = read_report(&identity).map_err(|err| MPITestError(format!("read: {}", err)))?;
        let written_by: BTreeSet<usize> = contents.rows.iter().map(|row| row.writer).collect();
        mpi_test_assert_eq!(contents.writers, layout.writer_ranks().collect::<Vec<_>>());
        mpi_test_assert!(written_by.iter().all(|writer| layout.is_writer(*writer)));
        mpi_test_assert!(written_by.len() <= layout.nwriters);
        for metric in opts.metric_defs() {
            let rows = contents.metric_rows(metric.id);
            mpi_test_assert_eq!(rows.len(), opts.cnodes);
            for (cnode, row) in rows.iter().enumerate() {
                mpi_test_assert_eq!(row.cnode, cnode as CnodeId);
                let expected = synthetic::global_row(opts, metric.id, row.cnode, size)
                    .map_err(|err| MPITestError(err.to_string()))?;
                mpi_test_assert_eq!(row.values, expected);
            }
        }
    }
    comm.barrier();
    Ok(())
}

fn main() {
    let universe = mpi::initialize().expect("failed to initialize MPI");
    let world = universe.world();
    let opts = ProfileOptions {
        cnodes: 37,
        ..ProfileOptions::default()
    };

    write_and_check(&world, "world_all", world.size() as usize, false, &opts)
        .expect("failed write with every rank writing");
    write_and_check(&world, "world_three", 3, false, &opts)
        .expect("failed write with three writers");
    write_and_check(&world, "world_bz2", 4, true, &opts)
        .expect("failed compressed write");

    // Half of the ranks each write their own report
    let half = world
        .split_by_color(Color::with_value(world.rank() % 2))
        .expect("failed to split communicator");
    let name = format!("half_{}", world.rank() % 2);
    write_and_check(&half, &name, 2, false, &opts)
        .expect("failed write on split communicator");
}
