//! File-backed report storage.
//!
//! Every rank opened as master or writer owns one data file
//! `<name>.r<rank>.data`. It starts with the magic `CUBEWR01` and a flag byte
//! (1 when blocks are bzip2 compressed). Each flush appends one block:
//!
//! ```text
//! u64 payload length | u32 row count | payload
//! ```
//!
//! and the payload is a sequence of rows
//! `u32 metric | u64 cnode | u32 value count | f64 values...`, all little endian.
//! The master also writes `<name>.index.json` with the metric metadata and
//! the ranks holding a data file on close. Readers only trust the files the
//! index lists, so files left over from an earlier session are ignored.
use std::fs::{self, File};
use std::io::prelude::*;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layout::Role;
use crate::storage::{check_can_write, check_master, ReportIdentity, ReportStorage, StorageFactory};
use crate::{CnodeId, MetricId};

const MAGIC: &[u8; 8] = b"CUBEWR01";
const FLAG_BZIP2: u8 = 1;

/// Metric entry of the report index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IndexedMetric {
    pub id: MetricId,
    pub name: String,
    pub cnodes: usize,
    /// Known cnodes, packed 64 per word.
    pub known: Vec<u64>,
}

impl IndexedMetric {
    /// Whether `cnode` was marked as known by the master.
    pub fn is_known(&self, cnode: CnodeId) -> bool {
        let word = (cnode / 64) as usize;
        self.known
            .get(word)
            .map(|bits| bits & (1u64 << (cnode % 64)) != 0)
            .unwrap_or(false)
    }
}

/// Index written by the master rank.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ReportIndex {
    pub name: String,
    pub compression: bool,
    /// Ranks that own a data file of this session.
    #[serde(default)]
    pub writers: Vec<usize>,
    pub metrics: Vec<IndexedMetric>,
}

impl ReportIndex {
    fn metric_mut(&mut self, id: MetricId) -> &mut IndexedMetric {
        let pos = match self.metrics.iter().position(|metric| metric.id == id) {
            Some(pos) => pos,
            None => {
                self.metrics.push(IndexedMetric {
                    id,
                    name: String::new(),
                    cnodes: 0,
                    known: vec![],
                });
                self.metrics.len() - 1
            }
        };
        &mut self.metrics[pos]
    }

    /// Look up a metric by id.
    pub fn metric(&self, id: MetricId) -> Option<&IndexedMetric> {
        self.metrics.iter().find(|metric| metric.id == id)
    }
}

/// Pack a boolean mask into 64-bit words.
fn pack_bits(mask: &[bool]) -> Vec<u64> {
    let mut words = vec![0u64; mask.len().div_ceil(64)];
    for (i, _) in mask.iter().enumerate().filter(|(_, known)| **known) {
        words[i / 64] |= 1u64 << (i % 64);
    }
    words
}

pub fn data_path(identity: &ReportIdentity, rank: usize) -> PathBuf {
    identity.dir.join(format!("{}.r{}.data", identity.name, rank))
}

pub fn index_path(identity: &ReportIdentity) -> PathBuf {
    identity.dir.join(format!("{}.index.json", identity.name))
}

/// Storage handle writing this rank's rows to its own data file.
#[derive(Debug)]
pub struct FileStorage {
    role: Role,
    rank: usize,
    identity: ReportIdentity,
    compression: bool,
    /// Data file, absent for slaves and after close.
    data: Option<BufWriter<File>>,
    /// Encoded rows waiting for the next flush.
    pending: Vec<u8>,
    pending_rows: u32,
    /// Only kept by the master.
    index: Option<ReportIndex>,
}

impl FileStorage {
    /// Open the storage of `rank` in `role`.
    pub fn open(role: Role, rank: usize, identity: &ReportIdentity, compression: bool) -> Result<FileStorage> {
        let data = if role == Role::Slave {
            None
        } else {
            fs::create_dir_all(&identity.dir)?;
            let path = data_path(identity, rank);
            let mut data = BufWriter::new(File::create(&path)?);
            data.write_all(MAGIC)?;
            data.write_all(&[if compression { FLAG_BZIP2 } else { 0 }])?;
            tracing::debug!(rank, ?role, path = %path.display(), "opened report data file");
            Some(data)
        };
        let index = (role == Role::Master).then(|| ReportIndex {
            name: identity.name.clone(),
            compression,
            writers: vec![rank],
            metrics: vec![],
        });
        Ok(FileStorage {
            role,
            rank,
            identity: identity.clone(),
            compression,
            data,
            pending: vec![],
            pending_rows: 0,
            index,
        })
    }

    fn index_mut(&mut self, op: &'static str) -> Result<&mut ReportIndex> {
        check_master(self.role, self.rank, op)?;
        self.index
            .as_mut()
            .ok_or_else(|| Error::CorruptReport(format!("rank {}: index already written", self.rank)))
    }

    fn write_index(&self) -> Result<()> {
        if let Some(index) = &self.index {
            let mut out = BufWriter::new(File::create(index_path(&self.identity))?);
            serde_json::to_writer_pretty(&mut out, index)?;
            out.flush()?;
        }
        Ok(())
    }
}

impl ReportStorage for FileStorage {
    fn role(&self) -> Role {
        self.role
    }

    fn define_metric(&mut self, metric: MetricId, name: &str, cnodes: usize) -> Result<()> {
        let entry = self.index_mut("define metrics")?.metric_mut(metric);
        entry.name = name.to_string();
        entry.cnodes = cnodes;
        Ok(())
    }

    fn set_known_cnodes(&mut self, metric: MetricId, known: &[bool]) -> Result<()> {
        self.index_mut("set known cnodes")?.metric_mut(metric).known = pack_bits(known);
        Ok(())
    }

    fn set_writer_ranks(&mut self, ranks: &[usize]) -> Result<()> {
        let index = self.index_mut("set writer ranks")?;
        index.writers = ranks.to_vec();
        index.writers.sort_unstable();
        index.writers.dedup();
        Ok(())
    }

    fn append_row(&mut self, metric: MetricId, cnode: CnodeId, values: &[f64]) -> Result<()> {
        check_can_write(self.role, self.rank, "append rows")?;
        let count: u32 = values
            .len()
            .try_into()
            .map_err(|_| Error::CorruptReport(format!("row for cnode {} is too long", cnode)))?;
        self.pending.extend_from_slice(&metric.to_le_bytes());
        self.pending.extend_from_slice(&cnode.to_le_bytes());
        self.pending.extend_from_slice(&count.to_le_bytes());
        for value in values {
            self.pending.extend_from_slice(&value.to_le_bytes());
        }
        self.pending_rows += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending_rows == 0 {
            return Ok(());
        }
        let Some(data) = self.data.as_mut() else {
            return Err(Error::ReadOnlyRole { rank: self.rank, role: self.role, op: "flush rows" });
        };
        let payload = if self.compression {
            let mut encoder = BzEncoder::new(Vec::<u8>::new(), Compression::default());
            encoder.write_all(&self.pending)?;
            encoder.finish()?
        } else {
            std::mem::take(&mut self.pending)
        };
        data.write_all(&(payload.len() as u64).to_le_bytes())?;
        data.write_all(&self.pending_rows.to_le_bytes())?;
        data.write_all(&payload)?;
        data.flush()?;
        tracing::trace!(rank = self.rank, rows = self.pending_rows, bytes = payload.len(), "flushed block");
        self.pending.clear();
        self.pending_rows = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.data.is_some() {
            self.flush()?;
        }
        self.write_index()?;
        self.index = None;
        if let Some(mut data) = self.data.take() {
            data.flush()?;
        }
        Ok(())
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if self.pending_rows > 0 || self.index.is_some() {
            tracing::warn!(
                rank = self.rank,
                pending_rows = self.pending_rows,
                "report storage dropped without close; pending data is lost"
            );
        }
    }
}

/// Factory for [`FileStorage`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FileStorageFactory;

impl StorageFactory for FileStorageFactory {
    type Storage = FileStorage;

    fn open(&self, role: Role, rank: usize, identity: &ReportIdentity, compression: bool) -> Result<FileStorage> {
        FileStorage::open(role, rank, identity, compression)
    }
}

/// A row read back from a data file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileRow {
    pub metric: MetricId,
    pub cnode: CnodeId,
    pub writer: usize,
    pub values: Vec<f64>,
}

/// Everything read back from a report.
#[derive(Clone, Debug)]
pub struct ReportContents {
    pub index: ReportIndex,
    pub rows: Vec<FileRow>,
    /// Ranks whose data files were read.
    pub writers: Vec<usize>,
}

impl ReportContents {
    /// Rows of one metric sorted by cnode.
    pub fn metric_rows(&self, metric: MetricId) -> Vec<&FileRow> {
        let mut rows: Vec<&FileRow> = self.rows.iter().filter(|row| row.metric == metric).collect();
        rows.sort_by_key(|row| row.cnode);
        rows
    }

    /// Rows whose metric has no entry in the index.
    pub fn undefined_metric_rows(&self) -> Vec<&FileRow> {
        self.rows
            .iter()
            .filter(|row| self.index.metric(row.metric).is_none())
            .collect()
    }
}

/// Bounds-checked little-endian reader over a byte slice.
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> ByteReader<'a> {
        ByteReader { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::CorruptReport(format!(
                "truncated data: wanted {} bytes at offset {}",
                n, self.pos
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }
}

/// Read every row of one data file.
pub fn read_data_file<P: AsRef<Path>>(path: P, writer: usize) -> Result<Vec<FileRow>> {
    let bytes = fs::read(path.as_ref())?;
    let mut reader = ByteReader::new(&bytes);
    if reader.take(MAGIC.len())? != MAGIC {
        return Err(Error::CorruptReport(format!("{}: bad magic", path.as_ref().display())));
    }
    let compressed = reader.array::<1>()?[0] == FLAG_BZIP2;

    let mut rows = vec![];
    while !reader.is_empty() {
        let len = reader.u64()? as usize;
        let count = reader.u32()?;
        let block = reader.take(len)?;
        let payload = if compressed {
            let mut out = vec![];
            BzDecoder::new(block).read_to_end(&mut out)?;
            out
        } else {
            block.to_vec()
        };
        let mut block_reader = ByteReader::new(&payload);
        for _ in 0..count {
            let metric = block_reader.u32()?;
            let cnode = block_reader.u64()?;
            let nvalues = block_reader.u32()? as usize;
            let values = (0..nvalues).map(|_| block_reader.f64()).collect::<Result<Vec<f64>>>()?;
            rows.push(FileRow { metric, cnode, writer, values });
        }
        if !block_reader.is_empty() {
            return Err(Error::CorruptReport("trailing bytes after block rows".to_string()));
        }
    }
    Ok(rows)
}

/// Read the index and the data files it lists.
pub fn read_report(identity: &ReportIdentity) -> Result<ReportContents> {
    let index: ReportIndex = serde_json::from_reader(File::open(index_path(identity))?)?;
    let writers = index.writers.clone();
    let mut rows = vec![];
    for &rank in &writers {
        rows.extend(read_data_file(data_path(identity, rank), rank)?);
    }
    Ok(ReportContents { index, rows, writers })
}
