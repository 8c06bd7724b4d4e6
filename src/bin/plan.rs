//! Print the round schedule of a writer configuration without running MPI.
use clap::Parser;
use cube_writer::storage::{NullStorage, NullStorageFactory, ReportIdentity};
use cube_writer::{format_ranks, CnodeId, WriteCoordinator};

#[derive(Parser)]
#[command(name = "plan")]
#[command(about = "Show which rank writes which cnode", long_about = None)]
struct Args {
    /// Number of ranks
    #[arg(short, long)]
    nprocs: usize,

    /// Requested number of writers
    #[arg(short, long, default_value = "1")]
    writers: usize,

    /// Number of cnodes of the metric
    #[arg(short, long)]
    cnodes: CnodeId,

    /// Compression (forces a single writer)
    #[arg(long)]
    compression: bool,

    /// Print the coordinator dump of every rank after each round
    #[arg(long)]
    dump: bool,

    /// Output the schedule as JSON
    #[arg(long)]
    json: bool,
}

#[derive(serde::Serialize)]
struct PlannedRound {
    round: usize,
    cnode: CnodeId,
    writer: usize,
    flush: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let identity = ReportIdentity::new(".", "plan");
    let mut coords = (0..args.nprocs)
        .map(|rank| WriteCoordinator::create(rank, args.nprocs, args.writers, &identity, args.compression, &NullStorageFactory))
        .collect::<cube_writer::Result<Vec<WriteCoordinator<NullStorage>>>>()?;
    let Some(first) = coords.first() else {
        anyhow::bail!("at least one rank is required");
    };

    let layout = *first.layout();
    let eligible: Vec<usize> = layout.writer_ranks().collect();
    if !args.json {
        println!("ranks: {}", layout.nprocs);
        println!("writers: {} (step {})", layout.nwriters, layout.step);
        println!("stride-eligible ranks: {}", format_ranks(&eligible));
    }

    for coord in coords.iter_mut() {
        coord.configure_metric(args.cnodes);
    }
    let mut rounds = vec![];
    loop {
        let valid: Vec<bool> = coords.iter_mut().map(|coord| coord.is_round_valid()).collect();
        if !valid[0] {
            break;
        }
        anyhow::ensure!(valid.iter().all(|v| *v), "ranks disagree on the round count");
        let writers: Vec<usize> = coords.iter().filter(|c| c.must_write_now()).map(|c| c.rank()).collect();
        let lead = &coords[0];
        anyhow::ensure!(
            writers == [lead.designated_writer_slot()],
            "round {}: writers {:?} do not match the designated slot",
            rounds.len(),
            writers
        );
        rounds.push(PlannedRound {
            round: rounds.len(),
            cnode: lead.current_collection_id(),
            writer: lead.designated_writer_slot(),
            flush: lead.is_flush_point(),
        });
        if args.dump {
            for coord in &coords {
                eprintln!("{}", coord.dump());
            }
        }
        for coord in coords.iter_mut() {
            coord.advance_round();
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rounds)?);
    } else {
        println!("{:>6} {:>8} {:>6} {}", "round", "cnode", "writer", "flush");
        for round in &rounds {
            println!(
                "{:>6} {:>8} {:>6} {}",
                round.round,
                round.cnode,
                round.writer,
                if round.flush { "yes" } else { "" }
            );
        }
    }
    Ok(())
}
