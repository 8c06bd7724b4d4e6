//! Read a written report back and check that every cnode has exactly one row.
use std::collections::BTreeMap;
use std::path::PathBuf;
use anyhow::Context;
use clap::Parser;
use cube_writer::storage::file::read_report;
use cube_writer::{format_ranks, CnodeId, ReportIdentity};

#[derive(Parser)]
#[command(name = "inspect")]
#[command(about = "Summarize a cube report written by pcubew", long_about = None)]
struct Args {
    /// Directory holding the report
    #[arg(short, long, default_value = "out")]
    dir: PathBuf,

    /// Report base name
    #[arg(short, long, default_value = "synthetic")]
    name: String,

    /// Print every row
    #[arg(long)]
    rows: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let identity = ReportIdentity::new(args.dir, args.name);
    let contents = read_report(&identity)
        .with_context(|| format!("failed to read report {} in {}", identity.name, identity.dir.display()))?;

    println!("report: {}", contents.index.name);
    println!("compression: {}", contents.index.compression);
    println!("data files from ranks: {}", format_ranks(&contents.writers));

    let mut complete = true;
    for metric in &contents.index.metrics {
        let rows = contents.metric_rows(metric.id);
        let mut counts: BTreeMap<CnodeId, usize> = BTreeMap::new();
        for row in &rows {
            *counts.entry(row.cnode).or_insert(0) += 1;
        }
        let missing = (0..metric.cnodes as CnodeId).filter(|cnode| !counts.contains_key(cnode)).count();
        let duplicated = counts.values().filter(|count| **count > 1).count();
        let unknown = rows.iter().filter(|row| !metric.is_known(row.cnode)).count();
        let sum: f64 = rows.iter().flat_map(|row| row.values.iter()).sum();
        println!(
            "metric {} ({}): {} cnodes, {} rows, {} missing, {} duplicated, {} unknown, sum {:.4}",
            metric.id,
            metric.name,
            metric.cnodes,
            rows.len(),
            missing,
            duplicated,
            unknown,
            sum
        );
        complete &= missing == 0 && duplicated == 0 && unknown == 0;
        if args.rows {
            for row in rows {
                println!("  cnode {:>6} writer {:>4} {:?}", row.cnode, row.writer, row.values);
            }
        }
    }
    let orphans = contents.undefined_metric_rows();
    if !orphans.is_empty() {
        let mut metrics: Vec<_> = orphans.iter().map(|row| row.metric).collect();
        metrics.sort();
        metrics.dedup();
        println!("{} rows of metrics missing from the index: {:?}", orphans.len(), metrics);
    }
    anyhow::ensure!(complete && orphans.is_empty(), "report is incomplete");
    Ok(())
}
