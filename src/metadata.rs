use crate::ledger::{Ledger, LedgerEntry};
use crate::run_info::run_name;
use crate::seq_files::base_name;
use crate::HandlerError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const METADATA_SUFFIX: &str = "_metadata.tsv";
pub const LEDGER_METADATA_FILE: &str = "fastq_metadata.tsv";

/// One row of the sample sheet handed to the remote platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    #[serde(rename = "sample name")]
    pub sample_name: String,
    pub fastq1: String,
    pub fastq2: String,
    #[serde(rename = "data set")]
    pub data_set: String,
    #[serde(rename = "vaccine status")]
    pub vaccine_status: String,
    pub week: String,
    #[serde(rename = "onset date")]
    pub onset_date: String,
    #[serde(rename = "collection date")]
    pub collection_date: String,
    #[serde(rename = "lab reception date")]
    pub lab_reception_date: String,
    pub latitude: String,
    pub longitude: String,
    pub region: String,
    pub country: String,
    pub division: String,
    pub location: String,
    #[serde(rename = "time elapsed")]
    pub time_elapsed: f64,
    pub dir: String,
    pub r1_local: String,
    pub r2_local: String,
}

impl MetadataEntry {
    pub fn new(sample_name: &str, fastq1: &Path, time_elapsed: f64) -> Self {
        Self {
            sample_name: sample_name.to_string(),
            fastq1: base_name(fastq1),
            time_elapsed,
            dir: fastq1.parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
            r1_local: fastq1.to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    pub fn from_ledger_entry(entry: &LedgerEntry) -> Self {
        Self::new(&entry.sample_id, Path::new(&entry.merged_file), entry.time_elapsed)
    }
}

/// `<metadata_dir>/<accumulator stem>_metadata.tsv`
pub fn sidecar_path(metadata_dir: &Path, merged_file: &Path) -> PathBuf {
    metadata_dir.join(format!("{}{}", run_name(&merged_file.to_string_lossy()), METADATA_SUFFIX))
}

pub fn write_metadata(path: &Path, entries: &[MetadataEntry]) -> Result<(), HandlerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    for entry in entries {
        writer.serialize(entry)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_metadata(path: &Path) -> Result<Vec<MetadataEntry>, HandlerError> {
    let mut reader = csv::ReaderBuilder::new().delimiter(b'\t').from_path(path)?;
    let mut entries = Vec::new();
    for row in reader.deserialize() {
        entries.push(row?);
    }
    Ok(entries)
}

/// Writes one metadata row per ledger entry to `fastq_metadata.tsv`.
pub fn export_ledger_metadata(ledger: &Ledger, metadata_dir: &Path) -> Result<PathBuf, HandlerError> {
    let entries: Vec<MetadataEntry> = ledger.entries().iter().map(MetadataEntry::from_ledger_entry).collect();
    let path = metadata_dir.join(LEDGER_METADATA_FILE);
    if entries.is_empty() {
        return Ok(path);
    }
    write_metadata(&path, &entries)?;
    Ok(path)
}
