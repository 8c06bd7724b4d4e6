//! Storage-writer handles the coordinator pairs with.
//!
//! A handle is opened per rank in the role computed by the writer layout.
//! Masters and writers append rows, the master additionally owns the metric
//! metadata. Slaves hold a handle too but can not persist anything.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layout::Role;
use crate::{CnodeId, MetricId};

pub mod file;

/// Name and location of a report.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ReportIdentity {
    /// Directory holding the report files.
    pub dir: PathBuf,
    /// Report base name.
    pub name: String,
}

impl ReportIdentity {
    pub fn new<P: Into<PathBuf>, N: Into<String>>(dir: P, name: N) -> ReportIdentity {
        ReportIdentity {
            dir: dir.into(),
            name: name.into(),
        }
    }
}

/// Per-rank handle to the report storage.
pub trait ReportStorage {
    /// Role the handle was opened in.
    fn role(&self) -> Role;

    /// Record metadata of a metric. Master only.
    fn define_metric(&mut self, metric: MetricId, name: &str, cnodes: usize) -> Result<()>;

    /// Set which cnodes are known for a metric. Master only.
    fn set_known_cnodes(&mut self, metric: MetricId, known: &[bool]) -> Result<()>;

    /// Record the ranks holding a writer handle in this session. Master only.
    fn set_writer_ranks(&mut self, _ranks: &[usize]) -> Result<()> {
        Ok(())
    }

    /// Append one row of gathered values for a cnode.
    fn append_row(&mut self, metric: MetricId, cnode: CnodeId, values: &[f64]) -> Result<()>;

    /// Commit buffered rows.
    fn flush(&mut self) -> Result<()>;

    /// Release the handle, committing anything still pending.
    fn close(&mut self) -> Result<()>;
}

/// Opens storage handles for a role.
pub trait StorageFactory {
    type Storage: ReportStorage;

    fn open(&self, role: Role, rank: usize, identity: &ReportIdentity, compression: bool) -> Result<Self::Storage>;

    /// Whether the storage layout only supports a single writer.
    fn single_writer(&self) -> bool {
        false
    }
}

/// Check that a handle may append rows.
pub(crate) fn check_can_write(role: Role, rank: usize, op: &'static str) -> Result<()> {
    if role == Role::Slave {
        return Err(Error::ReadOnlyRole { rank, role, op });
    }
    Ok(())
}

/// Check that a handle belongs to the master rank.
pub(crate) fn check_master(role: Role, rank: usize, op: &'static str) -> Result<()> {
    if role != Role::Master {
        return Err(Error::MasterOnly { rank, op });
    }
    Ok(())
}

/// Storage that accepts everything and keeps nothing.
#[derive(Debug)]
pub struct NullStorage {
    role: Role,
}

impl ReportStorage for NullStorage {
    fn role(&self) -> Role {
        self.role
    }

    fn define_metric(&mut self, _metric: MetricId, _name: &str, _cnodes: usize) -> Result<()> {
        Ok(())
    }

    fn set_known_cnodes(&mut self, _metric: MetricId, _known: &[bool]) -> Result<()> {
        Ok(())
    }

    fn append_row(&mut self, _metric: MetricId, _cnode: CnodeId, _values: &[f64]) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Factory for [`NullStorage`].
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStorageFactory;

impl StorageFactory for NullStorageFactory {
    type Storage = NullStorage;

    fn open(&self, role: Role, _rank: usize, _identity: &ReportIdentity, _compression: bool) -> Result<NullStorage> {
        Ok(NullStorage { role })
    }
}

/// A row committed to a [`MemoryReport`].
#[derive(Clone, Debug, PartialEq)]
pub struct StoredRow {
    pub metric: MetricId,
    pub cnode: CnodeId,
    /// Rank that wrote the row.
    pub writer: usize,
    pub values: Vec<f64>,
}

/// Metric metadata recorded by the master.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricInfo {
    pub name: String,
    pub cnodes: usize,
    pub known: Vec<bool>,
}

/// In-memory report shared by every rank of a process-local session.
#[derive(Debug, Default)]
pub struct MemoryReport {
    pub metrics: BTreeMap<MetricId, MetricInfo>,
    pub rows: Vec<StoredRow>,
    /// Number of flushes that committed at least one row.
    pub flushes: usize,
    /// Ranks whose handle has been closed.
    pub closed: Vec<usize>,
}

impl MemoryReport {
    /// Rows of one metric sorted by cnode.
    pub fn metric_rows(&self, metric: MetricId) -> Vec<&StoredRow> {
        let mut rows: Vec<&StoredRow> = self.rows.iter().filter(|row| row.metric == metric).collect();
        rows.sort_by_key(|row| row.cnode);
        rows
    }
}

/// Storage buffering rows per rank and committing them into a shared [`MemoryReport`].
#[derive(Debug)]
pub struct MemoryStorage {
    role: Role,
    rank: usize,
    pending: Vec<StoredRow>,
    report: Arc<Mutex<MemoryReport>>,
}

impl MemoryStorage {
    fn report(&self) -> Result<std::sync::MutexGuard<'_, MemoryReport>> {
        self.report
            .lock()
            .map_err(|_| Error::CorruptReport("memory report lock poisoned".to_string()))
    }

    /// Rows appended but not flushed yet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl ReportStorage for MemoryStorage {
    fn role(&self) -> Role {
        self.role
    }

    fn define_metric(&mut self, metric: MetricId, name: &str, cnodes: usize) -> Result<()> {
        check_master(self.role, self.rank, "define metrics")?;
        let mut report = self.report()?;
        let info = report.metrics.entry(metric).or_default();
        info.name = name.to_string();
        info.cnodes = cnodes;
        Ok(())
    }

    fn set_known_cnodes(&mut self, metric: MetricId, known: &[bool]) -> Result<()> {
        check_master(self.role, self.rank, "set known cnodes")?;
        let mut report = self.report()?;
        report.metrics.entry(metric).or_default().known = known.to_vec();
        Ok(())
    }

    fn append_row(&mut self, metric: MetricId, cnode: CnodeId, values: &[f64]) -> Result<()> {
        check_can_write(self.role, self.rank, "append rows")?;
        self.pending.push(StoredRow {
            metric,
            cnode,
            writer: self.rank,
            values: values.to_vec(),
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.pending);
        let mut report = self.report()?;
        report.rows.extend(rows);
        report.flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        let rank = self.rank;
        self.report()?.closed.push(rank);
        Ok(())
    }
}

/// Factory handing out [`MemoryStorage`] handles onto one shared report.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorageFactory {
    report: Arc<Mutex<MemoryReport>>,
    single_writer: bool,
}

impl MemoryStorageFactory {
    pub fn new() -> MemoryStorageFactory {
        MemoryStorageFactory::default()
    }

    /// A factory whose layout only allows a single writer.
    pub fn with_single_writer() -> MemoryStorageFactory {
        MemoryStorageFactory {
            single_writer: true,
            ..MemoryStorageFactory::default()
        }
    }

    /// The shared report all handles commit into.
    pub fn report(&self) -> Arc<Mutex<MemoryReport>> {
        Arc::clone(&self.report)
    }
}

impl StorageFactory for MemoryStorageFactory {
    type Storage = MemoryStorage;

    fn open(&self, role: Role, rank: usize, _identity: &ReportIdentity, _compression: bool) -> Result<MemoryStorage> {
        Ok(MemoryStorage {
            role,
            rank,
            pending: vec![],
            report: Arc::clone(&self.report),
        })
    }

    fn single_writer(&self) -> bool {
        self.single_writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ReportIdentity {
        ReportIdentity::new("/tmp", "memory")
    }

    #[test]
    fn test_slave_can_not_append() {
        let factory = MemoryStorageFactory::new();
        let mut slave = factory.open(Role::Slave, 3, &identity(), false).unwrap();
        let err = slave.append_row(0, 1, &[1.0]).unwrap_err();
        assert!(matches!(err, Error::ReadOnlyRole { rank: 3, role: Role::Slave, .. }));
        // flushing and closing an idle slave handle is fine
        slave.flush().unwrap();
        slave.close().unwrap();
    }

    #[test]
    fn test_metadata_is_master_only() {
        let factory = MemoryStorageFactory::new();
        let mut writer = factory.open(Role::Writer, 2, &identity(), false).unwrap();
        assert!(matches!(writer.define_metric(0, "time", 4), Err(Error::MasterOnly { rank: 2, .. })));
        assert!(matches!(writer.set_known_cnodes(0, &[true]), Err(Error::MasterOnly { .. })));

        let mut master = factory.open(Role::Master, 0, &identity(), false).unwrap();
        master.define_metric(0, "time", 2).unwrap();
        master.set_known_cnodes(0, &[true, false]).unwrap();
        let report = factory.report();
        let report = report.lock().unwrap();
        assert_eq!(report.metrics[&0].name, "time");
        assert_eq!(report.metrics[&0].known, vec![true, false]);
    }

    #[test]
    fn test_rows_are_committed_on_flush() {
        let factory = MemoryStorageFactory::new();
        let mut writer = factory.open(Role::Writer, 1, &identity(), false).unwrap();
        writer.append_row(0, 5, &[1.0, 2.0]).unwrap();
        writer.append_row(0, 2, &[3.0, 4.0]).unwrap();
        assert_eq!(writer.pending(), 2);
        assert!(factory.report().lock().unwrap().rows.is_empty());

        writer.flush().unwrap();
        writer.flush().unwrap();
        writer.append_row(1, 0, &[]).unwrap();
        writer.close().unwrap();

        let report = factory.report();
        let report = report.lock().unwrap();
        assert_eq!(report.flushes, 2);
        assert_eq!(report.closed, vec![1]);
        let cnodes: Vec<CnodeId> = report.metric_rows(0).iter().map(|row| row.cnode).collect();
        assert_eq!(cnodes, vec![2, 5]);
        assert_eq!(report.metric_rows(1)[0].writer, 1);
    }
}
