//! Synthetic profile values.
//!
//! Produces a reproducible metric value for every (metric, cnode, rank,
//! location) tuple, independent of how many ranks run the generator. Used by
//! the demo binary and by tests to check what ends up in a report.
use rand::prelude::*;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::driver::MetricDef;
use crate::error::{Error, Result};
use crate::{CnodeId, MetricId};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProfileOptions {
    /// Metric names, the position is the metric id.
    pub metrics: Vec<String>,
    /// Number of cnodes (call paths) per metric.
    pub cnodes: usize,
    /// Locations (threads) each rank contributes per cnode.
    pub locations_per_rank: usize,
    /// Mean metric value.
    pub mean: f64,
    /// Coefficient of variation of the values.
    pub cv: f64,
    /// Seed for the RNG.
    pub seed: u64,
}

impl Default for ProfileOptions {
    fn default() -> ProfileOptions {
        ProfileOptions {
            metrics: vec!["time".to_string(), "visits".to_string()],
            cnodes: 64,
            locations_per_rank: 2,
            mean: 10.0,
            cv: 0.5,
            seed: 100,
        }
    }
}

impl ProfileOptions {
    /// Metric definitions for the driver.
    pub fn metric_defs(&self) -> Vec<MetricDef> {
        self.metrics
            .iter()
            .enumerate()
            .map(|(id, name)| MetricDef {
                id: id as MetricId,
                name: name.clone(),
                cnodes: self.cnodes as CnodeId,
            })
            .collect()
    }
}

/// Value distribution, normal or log-normal.
#[derive(Clone, Debug)]
pub struct ValueDistribution {
    distr: Normal<f64>,
    /// Use the normal distribution rather than the log-normal one
    use_normal: bool,
}

impl ValueDistribution {
    pub fn new(mean: f64, cv: f64) -> Result<ValueDistribution> {
        let std_dev = cv * mean;
        // The normal distribution would produce many negative values otherwise
        let use_normal = mean > (3.0 * std_dev);
        let distr = if use_normal {
            Normal::new(mean, std_dev)
        } else {
            let mean_log_norm = (mean * mean / (mean * mean + std_dev * std_dev).sqrt()).ln();
            let std_dev_log_norm = (1.0 + std_dev * std_dev / (mean * mean)).ln().sqrt();
            Normal::new(mean_log_norm, std_dev_log_norm)
        };
        let distr = distr.map_err(|err| Error::Distribution(format!("mean {} cv {}: {}", mean, cv, err)))?;
        Ok(ValueDistribution { distr, use_normal })
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if self.use_normal {
            self.distr.sample(rng)
        } else {
            self.distr.sample(rng).exp()
        }
    }
}

/// RNG dedicated to one (metric, cnode, rank) row.
fn row_rng(seed: u64, metric: MetricId, cnode: CnodeId, rank: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(rank as u64));
    rng.set_stream(((metric as u64) << 32) ^ cnode);
    rng
}

/// Values of one cnode contributed by `rank`.
pub fn local_row(
    opts: &ProfileOptions,
    distr: &ValueDistribution,
    metric: MetricId,
    cnode: CnodeId,
    rank: usize,
) -> Vec<f64> {
    let mut rng = row_rng(opts.seed, metric, cnode, rank);
    (0..opts.locations_per_rank).map(|_| distr.sample(&mut rng)).collect()
}

/// Every row of a metric contributed by `rank`, computed in parallel.
pub fn local_rows(opts: &ProfileOptions, metric: MetricId, rank: usize) -> Result<Vec<Vec<f64>>> {
    let distr = ValueDistribution::new(opts.mean, opts.cv)?;
    Ok((0..opts.cnodes as CnodeId)
        .into_par_iter()
        .map(|cnode| local_row(opts, &distr, metric, cnode, rank))
        .collect())
}

/// The row a writer receives for `cnode` after gathering over `nprocs` ranks.
pub fn global_row(opts: &ProfileOptions, metric: MetricId, cnode: CnodeId, nprocs: usize) -> Result<Vec<f64>> {
    let distr = ValueDistribution::new(opts.mean, opts.cv)?;
    Ok((0..nprocs)
        .flat_map(|rank| local_row(opts, &distr, metric, cnode, rank))
        .collect())
}
