use crate::run_info::{pad_barcode, run_number, sample_id_from_merged};
use crate::seq_files::base_name;
use crate::HandlerError;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const LEDGER_FILE: &str = "processed.tsv";
pub const LEDGER_COLUMNS: [&str; 6] = ["sample_id", "fastq", "dir", "barcode", "time", "merged"];

/// One processed source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(default)]
    pub sample_id: String,
    #[serde(rename = "fastq")]
    pub source_file: String,
    #[serde(rename = "dir")]
    pub source_dir: String,
    #[serde(default)]
    pub barcode: String,
    #[serde(rename = "time")]
    pub time_elapsed: f64,
    #[serde(rename = "merged")]
    pub merged_file: String,
}

/// Normalised string form of a directory, used as part of the ledger key.
pub fn dir_key(dir: &Path) -> String {
    let absolute = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());
    let text = absolute.to_string_lossy();
    let trimmed = text.trim_end_matches(std::path::MAIN_SEPARATOR);
    if trimmed.is_empty() {
        text.into_owned()
    } else {
        trimmed.to_string()
    }
}

/// Provenance table of every source file folded into an accumulator.
///
/// Rows are kept in arrival order and never mutated; "first" and "last"
/// queries follow that order, which stays chronological across restarts
/// even though `time_elapsed` restarts at zero with each process.
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    index: FxHashMap<(String, String), usize>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `processed.tsv` from `dir`; an absent file gives an empty ledger.
    ///
    /// Any other read or parse failure is returned to the caller.
    pub fn load(dir: &Path) -> Result<Self, HandlerError> {
        let path = dir.join(LEDGER_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no ledger found, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(HandlerError::Io(e)),
        };

        let mut reader = csv::ReaderBuilder::new().delimiter(b'\t').from_reader(file);

        let headers = reader.headers()?.clone();
        for required in ["fastq", "dir", "time", "merged"] {
            if !headers.iter().any(|h| h == required) {
                return Err(HandlerError::Ledger(format!(
                    "{} is missing required column '{}'",
                    path.display(),
                    required
                )));
            }
        }

        let mut ledger = Self::new();
        for row in reader.deserialize() {
            let mut entry: LedgerEntry = row?;
            entry.barcode = if entry.barcode.is_empty() {
                ledger.barcode_for(&entry.source_file, &entry.source_dir)
            } else {
                pad_barcode(&entry.barcode)
            };
            if entry.sample_id.is_empty() {
                entry.sample_id = sample_id_from_merged(&entry.merged_file);
            }
            ledger.push(entry);
        }

        tracing::info!(path = %path.display(), rows = ledger.len(), "ledger loaded");
        Ok(ledger)
    }

    fn push(&mut self, entry: LedgerEntry) {
        let key = (entry.source_dir.clone(), entry.source_file.clone());
        if self.index.contains_key(&key) {
            tracing::warn!(dir = %key.0, file = %key.1, "duplicate ledger row kept unindexed");
        } else {
            self.index.insert(key, self.entries.len());
        }
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn entries_for_dir<'a>(&'a self, source_dir: &'a str) -> impl Iterator<Item = &'a LedgerEntry> + 'a {
        self.entries.iter().filter(move |e| e.source_dir == source_dir)
    }

    /// Exact `(source_dir, basename(source_file))` match.
    pub fn exists(&self, source_file: &str, source_dir: &str) -> bool {
        self.lookup(source_file, source_dir).is_some()
    }

    pub fn lookup(&self, source_file: &str, source_dir: &str) -> Option<&LedgerEntry> {
        let key = (source_dir.to_string(), base_name(Path::new(source_file)));
        self.index.get(&key).map(|&i| &self.entries[i])
    }

    /// Barcode of the earliest entry for `source_dir`, empty if none.
    pub fn first_barcode(&self, source_dir: &str) -> String {
        self.entries_for_dir(source_dir)
            .next()
            .map(|e| e.barcode.clone())
            .unwrap_or_default()
    }

    /// Accumulator of the latest entry for `source_dir`, empty if none.
    pub fn last_merged(&self, source_dir: &str) -> String {
        self.entries
            .iter()
            .rev()
            .find(|e| e.source_dir == source_dir)
            .map(|e| e.merged_file.clone())
            .unwrap_or_default()
    }

    /// Accumulator of the latest entry for `sample_id` in any directory, empty if none.
    pub fn last_merged_for_sample(&self, sample_id: &str) -> String {
        self.last_merged_for_sample_outside(sample_id, None)
    }

    /// Like [`Ledger::last_merged_for_sample`] but ignoring rows from `exclude_dir`.
    pub fn last_merged_for_sample_outside(&self, sample_id: &str, exclude_dir: Option<&str>) -> String {
        self.entries
            .iter()
            .rev()
            .filter(|e| Some(e.source_dir.as_str()) != exclude_dir)
            .find(|e| e.sample_id == sample_id)
            .map(|e| e.merged_file.clone())
            .unwrap_or_default()
    }

    /// Zero-padded count of entries already recorded for `source_dir`.
    pub fn next_barcode(&self, source_dir: &str) -> String {
        pad_barcode(&self.entries_for_dir(source_dir).count().to_string())
    }

    /// Barcode a new file would be recorded under.
    pub fn barcode_for(&self, source_file: &str, source_dir: &str) -> String {
        match run_number(source_file) {
            Some(number) => pad_barcode(&number),
            None => self.next_barcode(source_dir),
        }
    }

    /// Recorded time for a pair, `0.0` when the pair is unknown.
    pub fn file_time(&self, source_file: &str, source_dir: &str) -> f64 {
        self.lookup(source_file, source_dir)
            .map(|e| e.time_elapsed)
            .unwrap_or(0.0)
    }

    /// Appends one row; recording an existing pair is an error.
    pub fn record(
        &mut self,
        source_file: &str,
        source_dir: &str,
        time_elapsed: f64,
        merged_file: &str,
    ) -> Result<&LedgerEntry, HandlerError> {
        if self.exists(source_file, source_dir) {
            return Err(HandlerError::Ledger(format!(
                "{} in {} is already recorded",
                source_file, source_dir
            )));
        }

        let entry = LedgerEntry {
            sample_id: sample_id_from_merged(merged_file),
            source_file: base_name(Path::new(source_file)),
            source_dir: source_dir.to_string(),
            barcode: self.barcode_for(source_file, source_dir),
            time_elapsed,
            merged_file: merged_file.to_string(),
        };
        self.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Rewrites `processed.tsv` under `dir` in full.
    pub fn flush(&self, dir: &Path) -> Result<PathBuf, HandlerError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LEDGER_FILE);
        let temp_path = dir.join(format!("{}.tmp", LEDGER_FILE));

        {
            let mut writer = csv::WriterBuilder::new()
                .delimiter(b'\t')
                .has_headers(false)
                .from_path(&temp_path)?;
            writer.write_record(LEDGER_COLUMNS)?;
            for entry in &self.entries {
                writer.serialize(entry)?;
            }
            writer.flush()?;
        }

        fs::rename(&temp_path, &path)?;
        tracing::debug!(path = %path.display(), rows = self.len(), "ledger flushed");
        Ok(path)
    }

    /// Drops every row. Irreversible once flushed.
    pub fn clear(&mut self) {
        tracing::warn!(rows = self.len(), "deleting all ledger records");
        self.entries.clear();
        self.index.clear();
    }
}
