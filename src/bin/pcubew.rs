//! Write a synthetic cube report from all MPI ranks.
use std::path::PathBuf;
use anyhow::Context;
use clap::Parser;
use mpi::traits::*;
use tracing_subscriber::EnvFilter;
use cube_writer::comm::{MpiGather, ValueGather};
use cube_writer::config::WriterOptions;
use cube_writer::driver::write_report;
use cube_writer::storage::file::FileStorageFactory;
use cube_writer::synthetic;
use cube_writer::{Error, MetricId, WriteCoordinator};

#[derive(Parser)]
#[command(name = "pcubew")]
#[command(about = "Write a synthetic cube report in parallel", long_about = None)]
struct Args {
    /// Writer options file
    #[arg(short, long, default_value = "data/writer_opts.json")]
    opts: PathBuf,

    /// Override the requested number of writers
    #[arg(short, long)]
    writers: Option<usize>,

    /// Override compression
    #[arg(long)]
    compression: Option<bool>,

    /// Override the output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Print per-rank statistics as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cube_writer=info,warn")),
        )
        .init();

    let args = Args::parse();
    let universe = mpi::initialize().context("failed to initialize MPI")?;
    let world = universe.world();
    let gather = MpiGather::new(&world);
    let rank = gather.rank();
    let size = gather.size();

    let mut opts = WriterOptions::load(&args.opts)
        .with_context(|| format!("failed to load writer options {}", args.opts.display()))?;
    if let Some(writers) = args.writers {
        opts.writers = writers;
    }
    if let Some(compression) = args.compression {
        opts.compression = compression;
    }
    if let Some(dir) = args.output_dir {
        opts.output_dir = dir;
    }

    let identity = opts.identity();
    let mut coord = WriteCoordinator::create(rank, size, opts.writers, &identity, opts.compression, &FileStorageFactory)
        .with_context(|| format!("rank {} failed to open report {}", rank, identity.name))?;
    if rank == 0 {
        tracing::info!(
            ranks = size,
            writers = coord.layout().nwriters,
            step = coord.layout().step,
            report = %identity.name,
            "writing report"
        );
    }

    // Rows of the metric being written, generated in one go per metric
    let mut cached: Option<(MetricId, Vec<Vec<f64>>)> = None;
    let stats = write_report(&mut coord, &gather, &opts.profile.metric_defs(), |metric, cnode| {
        if cached.as_ref().map(|(id, _)| *id) != Some(metric.id) {
            cached = Some((metric.id, synthetic::local_rows(&opts.profile, metric.id, rank)?));
        }
        let rows = cached.as_ref().map(|(_, rows)| rows.as_slice()).unwrap_or(&[]);
        rows.get(cnode as usize)
            .cloned()
            .ok_or_else(|| Error::CorruptReport(format!("no synthetic row for cnode {}", cnode)))
    })?;
    coord.finalize().context("failed to close report storage")?;
    world.barrier();

    if args.json {
        println!("{}", serde_json::to_string(&stats)?);
    } else if stats.rows_written > 0 {
        println!(
            "rank {}: {} rows in {} flushes over {} metrics ({:.3}s)",
            rank, stats.rows_written, stats.flushes, stats.metrics, stats.elapsed_seconds
        );
    }
    Ok(())
}
