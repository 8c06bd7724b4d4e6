//! Writer options, loaded from a JSON file.
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::ReportIdentity;
use crate::synthetic::ProfileOptions;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WriterOptions {
    /// Report base name.
    pub report: String,
    /// Directory the report files are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Requested number of writer ranks.
    #[serde(default = "default_writers")]
    pub writers: usize,
    /// Compress data blocks, forces a single writer.
    #[serde(default)]
    pub compression: bool,
    /// Synthetic profile to write.
    #[serde(default)]
    pub profile: ProfileOptions,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_writers() -> usize {
    1
}

impl WriterOptions {
    /// Load the options from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<WriterOptions> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn identity(&self) -> ReportIdentity {
        ReportIdentity::new(self.output_dir.clone(), self.report.clone())
    }
}
