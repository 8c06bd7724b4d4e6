//! Report generation loop.
//!
//! Drives a [`WriteCoordinator`] through every metric of a report: gather the
//! row of the current cnode onto the designated writer, let that writer append
//! it, commit at flush points and advance. Every rank has to call these
//! functions with the same metrics in the same order.
use std::time::Instant;
use serde::{Deserialize, Serialize};

use crate::comm::ValueGather;
use crate::coordinator::WriteCoordinator;
use crate::error::{Error, Result};
use crate::layout::Role;
use crate::storage::ReportStorage;
use crate::{CnodeId, MetricId};

/// A metric to serialize.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MetricDef {
    pub id: MetricId,
    pub name: String,
    /// Number of cnodes carrying a row for this metric.
    pub cnodes: CnodeId,
}

/// What one rank did while writing a metric.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricStats {
    /// Rounds (gathers) taken part in.
    pub rounds: usize,
    /// Rows appended by this rank.
    pub rows_written: usize,
    /// Flush points reached.
    pub flushes: usize,
}

/// Totals of one rank over a whole report.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ReportStats {
    pub rank: usize,
    pub metrics: usize,
    pub rounds: usize,
    pub rows_written: usize,
    pub flushes: usize,
    pub elapsed_seconds: f64,
}

impl ReportStats {
    fn add(&mut self, stats: &MetricStats) {
        self.metrics += 1;
        self.rounds += stats.rounds;
        self.rows_written += stats.rows_written;
        self.flushes += stats.flushes;
    }
}

/// Write one metric.
///
/// `local_row` returns this rank's values for a cnode. It is called once per
/// round on every rank, whether or not the rank writes.
pub fn write_metric<S, G, F>(
    coord: &mut WriteCoordinator<S>,
    gather: &G,
    metric: &MetricDef,
    mut local_row: F,
) -> Result<MetricStats>
where
    S: ReportStorage,
    G: ValueGather,
    F: FnMut(CnodeId) -> Result<Vec<f64>>,
{
    if coord.role() == Role::Master {
        let storage = coord.storage_mut();
        storage.define_metric(metric.id, &metric.name, metric.cnodes as usize)?;
        storage.set_known_cnodes(metric.id, &vec![true; metric.cnodes as usize])?;
    }

    let mut stats = MetricStats::default();
    coord.configure_metric(metric.cnodes);
    while coord.is_round_valid() {
        let cnode = coord.current_collection_id();
        let root = coord.designated_writer_slot();
        let local = local_row(cnode)?;
        let gathered = gather.gather(root, &local)?;
        if let Some(id) = coord.id_to_write() {
            let row = gathered.ok_or_else(|| {
                Error::Gather(format!("rank {} writes cnode {} but received no values", coord.rank(), id))
            })?;
            coord.storage_mut().append_row(metric.id, id, &row)?;
            stats.rows_written += 1;
        }
        if coord.is_flush_point() {
            coord.storage_mut().flush()?;
            stats.flushes += 1;
        }
        coord.advance_round();
        stats.rounds += 1;
    }
    tracing::debug!(
        rank = coord.rank(),
        metric = %metric.name,
        rounds = stats.rounds,
        rows_written = stats.rows_written,
        flushes = stats.flushes,
        "metric written"
    );
    Ok(stats)
}

/// Write every metric of a report.
pub fn write_report<S, G, F>(
    coord: &mut WriteCoordinator<S>,
    gather: &G,
    metrics: &[MetricDef],
    mut local_row: F,
) -> Result<ReportStats>
where
    S: ReportStorage,
    G: ValueGather,
    F: FnMut(&MetricDef, CnodeId) -> Result<Vec<f64>>,
{
    let start = Instant::now();
    let mut report = ReportStats {
        rank: coord.rank(),
        ..ReportStats::default()
    };
    for metric in metrics {
        let stats = write_metric(coord, gather, metric, |cnode| local_row(metric, cnode))?;
        if coord.rank() == 0 {
            tracing::info!(metric = %metric.name, cnodes = metric.cnodes, rounds = stats.rounds, "wrote metric");
        }
        report.add(&stats);
    }
    report.elapsed_seconds = start.elapsed().as_secs_f64();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::thread;
    use super::*;
    use crate::comm::channel_group;
    use crate::storage::{MemoryReport, MemoryStorageFactory, ReportIdentity};
    use crate::synthetic::{self, ProfileOptions, ValueDistribution};

    /// Write a synthetic report with one thread per rank and return the shared report.
    fn write_threaded(nprocs: usize, writers: usize, opts: &ProfileOptions) -> (MemoryReport, Vec<ReportStats>) {
        let factory = MemoryStorageFactory::new();
        let identity = ReportIdentity::new("/tmp", "threaded");
        let handles: Vec<_> = channel_group(nprocs)
            .into_iter()
            .map(|gather| {
                let factory = factory.clone();
                let identity = identity.clone();
                let opts = opts.clone();
                thread::spawn(move || {
                    let rank = gather.rank();
                    let mut coord = WriteCoordinator::create(rank, nprocs, writers, &identity, false, &factory).unwrap();
                    let distr = ValueDistribution::new(opts.mean, opts.cv).unwrap();
                    let stats = write_report(&mut coord, &gather, &opts.metric_defs(), |metric, cnode| {
                        Ok(synthetic::local_row(&opts, &distr, metric.id, cnode, rank))
                    })
                    .unwrap();
                    coord.finalize().unwrap();
                    stats
                })
            })
            .collect();
        let stats = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let report = std::mem::take(&mut *factory.report().lock().unwrap());
        (report, stats)
    }

    #[test]
    fn test_every_cnode_written_once() {
        let opts = ProfileOptions {
            cnodes: 23,
            ..ProfileOptions::default()
        };
        let (report, stats) = write_threaded(6, 4, &opts);
        // 6 ranks asking for 4 writers: step 2, writers 0, 2 and 4
        let writers: Vec<usize> = stats.iter().filter(|s| s.rows_written > 0).map(|s| s.rank).collect();
        assert_eq!(writers, vec![0, 2, 4]);
        assert!(stats.iter().all(|s| s.rounds == 2 * 23));

        for metric in opts.metric_defs() {
            let rows = report.metric_rows(metric.id);
            assert_eq!(rows.len(), 23);
            for (cnode, row) in rows.iter().enumerate() {
                assert_eq!(row.cnode, cnode as CnodeId);
                assert_eq!(row.values, synthetic::global_row(&opts, metric.id, row.cnode, 6).unwrap());
            }
            let info = &report.metrics[&metric.id];
            assert_eq!(info.name, metric.name);
            assert_eq!(info.known, vec![true; 23]);
        }
        let mut closed = report.closed.clone();
        closed.sort();
        assert_eq!(closed, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_single_rank_report() {
        let opts = ProfileOptions {
            cnodes: 5,
            metrics: vec!["time".to_string()],
            ..ProfileOptions::default()
        };
        let (report, stats) = write_threaded(1, 3, &opts);
        assert_eq!(stats[0].rows_written, 5);
        // one writer: every round closes a pass
        assert_eq!(stats[0].flushes, 5);
        assert_eq!(report.flushes, 5);
        assert_eq!(report.rows.len(), 5);
    }

    #[test]
    fn test_empty_metric_is_skipped() {
        let opts = ProfileOptions {
            cnodes: 0,
            ..ProfileOptions::default()
        };
        let (report, stats) = write_threaded(3, 3, &opts);
        assert!(report.rows.is_empty());
        assert!(stats.iter().all(|s| s.rounds == 0 && s.metrics == 2));
        assert_eq!(report.metrics.len(), 2);
    }
}
