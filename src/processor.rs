use crate::actions::ProcessAction;
use crate::config::{NamingMode, RunConfig};
use crate::ledger::{dir_key, Ledger};
use crate::open_probe::OpenFileProbe;
use crate::seq_files::{base_name, list_sequence_files};
use crate::HandlerError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

const PENDING_SUFFIX: &str = ".pending";

/// Result of folding one source file into its accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub source_file: PathBuf,
    pub source_dir: String,
    pub merged_file: PathBuf,
    pub sample_id: String,
    pub barcode: String,
    /// True when this was the first file ever recorded for the directory.
    pub first_in_dir: bool,
    /// True when the accumulator already holds an earlier accumulator of the
    /// same directory, so anything stitched into that one is carried along.
    pub carries_previous: bool,
}

/// Files ready to merge in one directory for this pass.
#[derive(Debug, Default, Clone)]
pub struct Candidates {
    pub files: Vec<PathBuf>,
    /// Unrecorded files still held open by the writer.
    pub skipped_open: usize,
}

#[derive(Debug, Default, Clone)]
pub struct DirectoryReport {
    pub merged: Vec<MergeOutcome>,
    pub skipped_open: usize,
    pub recovered: usize,
}

/// Written next to an accumulator while an append is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingMerge {
    source_file: String,
    source_dir: String,
    accumulator: PathBuf,
    length_before: u64,
}

/// Processes one concrete directory: the flat root or a barcode subdirectory.
pub struct DirectoryProcessor<'a> {
    config: &'a RunConfig,
    probe: &'a dyn OpenFileProbe,
    actions: &'a [Box<dyn ProcessAction>],
    started: Instant,
}

impl<'a> DirectoryProcessor<'a> {
    pub fn new(
        config: &'a RunConfig,
        probe: &'a dyn OpenFileProbe,
        actions: &'a [Box<dyn ProcessAction>],
        started: Instant,
    ) -> Self {
        Self { config, probe, actions, started }
    }

    fn time_since_start(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Unrecorded sequence files of `dir` that nobody else holds open, sorted by name.
    pub fn list_new_files(&self, ledger: &Ledger, dir: &Path) -> Result<Candidates, HandlerError> {
        let key = dir_key(dir);
        let mut candidates = Candidates::default();

        for name in list_sequence_files(dir)? {
            if ledger.exists(&name, &key) {
                continue;
            }
            let path = dir.join(&name);
            if self.probe.is_open(&path) {
                tracing::info!(file = %path.display(), "file still open, retrying next pass");
                candidates.skipped_open += 1;
                continue;
            }
            candidates.files.push(path);
        }

        if candidates.files.is_empty() {
            tracing::info!(dir = %dir.display(), "no new files");
        }
        Ok(candidates)
    }

    /// Destination for `file` given the current ledger state.
    pub fn accumulator_name(&self, ledger: &Ledger, file: &Path, dir: &Path) -> PathBuf {
        let merged_dir = self.config.merged_dir(dir);
        if self.config.naming == NamingMode::KeepOriginal {
            return merged_dir.join(base_name(file));
        }

        let key = dir_key(dir);
        let file_text = file.to_string_lossy();
        let run_id = ledger.barcode_for(&file_text, &key);
        let mut anchor = ledger.first_barcode(&key);
        if anchor.is_empty() {
            anchor = run_id.clone();
        }

        let mut prefix = file.parent().map(base_name).unwrap_or_default();
        if !self.config.name_tag.is_empty() {
            prefix = format!("{}_{}", prefix, self.config.name_tag);
        }

        merged_dir.join(format!("{}_{}-{}.fastq.gz", prefix, anchor, run_id))
    }

    /// Appends `file` to its accumulator and records it in the ledger.
    ///
    /// A pending marker brackets the append so an interrupted merge can be
    /// rolled back on the next pass instead of appending twice. The marker is
    /// only removed once the ledger row is on disk.
    pub fn merge_one(&self, ledger: &mut Ledger, file: &Path, dir: &Path) -> Result<MergeOutcome, HandlerError> {
        let key = dir_key(dir);
        let destination = self.accumulator_name(ledger, file, dir);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let length_before = match fs::metadata(&destination) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(HandlerError::Io(e)),
        };

        let marker = PendingMerge {
            source_file: base_name(file),
            source_dir: key.clone(),
            accumulator: destination.clone(),
            length_before,
        };
        let marker_path = pending_path(&destination);
        fs::write(&marker_path, serde_json::to_vec(&marker)?)?;

        let mut accumulator = OpenOptions::new().create(true).append(true).open(&destination)?;

        if self.config.naming == NamingMode::Rename && length_before == 0 {
            let previous = ledger.last_merged(&key);
            if !previous.is_empty() && Path::new(&previous) != destination {
                match File::open(&previous) {
                    Ok(mut seed) => {
                        io::copy(&mut seed, &mut accumulator)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::warn!(previous = %previous, "previous accumulator missing, starting fresh");
                    }
                    Err(e) => return Err(HandlerError::Io(e)),
                }
            }
        }

        let mut source = File::open(file)?;
        let appended = io::copy(&mut source, &mut accumulator)?;
        accumulator.sync_all()?;
        drop(accumulator);

        let merged_text = destination.to_string_lossy().into_owned();
        let (sample_id, barcode) = {
            let entry = ledger.record(&file.to_string_lossy(), &key, self.time_since_start(), &merged_text)?;
            (entry.sample_id.clone(), entry.barcode.clone())
        };
        ledger.flush(&self.config.logs_dir())?;
        fs::remove_file(&marker_path)?;

        let first_in_dir = ledger.entries_for_dir(&key).count() == 1;
        let outcome = MergeOutcome {
            source_file: file.to_path_buf(),
            source_dir: key.clone(),
            merged_file: destination.clone(),
            sample_id,
            barcode,
            first_in_dir,
            carries_previous: self.config.naming == NamingMode::Rename && !first_in_dir,
        };

        tracing::info!(
            file = %file.display(),
            merged = %destination.display(),
            bytes = appended,
            barcode = %outcome.barcode,
            "merged"
        );
        Ok(outcome)
    }

    /// Runs every configured action; failures are logged and do not undo the merge.
    pub fn run_action_hooks(&self, ledger: &Ledger, outcome: &MergeOutcome) {
        for action in self.actions {
            if let Err(e) = action.process(outcome, ledger) {
                tracing::warn!(
                    action = action.name(),
                    merged = %outcome.merged_file.display(),
                    error = %e,
                    "post-merge action failed"
                );
            }
        }
    }

    /// Rolls back appends that were interrupted before their ledger row was written.
    pub fn recover_pending(&self, ledger: &Ledger, dir: &Path) -> Result<usize, HandlerError> {
        let merged_dir = self.config.merged_dir(dir);
        if !merged_dir.is_dir() {
            return Ok(0);
        }

        let mut recovered = 0;
        for entry in fs::read_dir(&merged_dir)? {
            let marker_path = entry?.path();
            if !marker_path.to_string_lossy().ends_with(PENDING_SUFFIX) {
                continue;
            }
            let marker: PendingMerge = serde_json::from_slice(&fs::read(&marker_path)?)?;

            if !ledger.exists(&marker.source_file, &marker.source_dir) && marker.accumulator.exists() {
                let accumulator = OpenOptions::new().write(true).open(&marker.accumulator)?;
                accumulator.set_len(marker.length_before)?;
                accumulator.sync_all()?;
                tracing::warn!(
                    accumulator = %marker.accumulator.display(),
                    source = %marker.source_file,
                    length = marker.length_before,
                    "rolled back interrupted merge"
                );
                recovered += 1;
            }
            fs::remove_file(&marker_path)?;
        }
        Ok(recovered)
    }

    /// One pass over `dir`: recover, list, then merge each new file in order.
    pub fn process_directory(&self, ledger: &mut Ledger, dir: &Path) -> Result<DirectoryReport, HandlerError> {
        fs::create_dir_all(self.config.merged_dir(dir))?;

        let mut report = DirectoryReport {
            recovered: self.recover_pending(ledger, dir)?,
            ..DirectoryReport::default()
        };

        let candidates = self.list_new_files(ledger, dir)?;
        report.skipped_open = candidates.skipped_open;

        for file in candidates.files {
            let outcome = self.merge_one(ledger, &file, dir)?;
            self.run_action_hooks(ledger, &outcome);
            report.merged.push(outcome);
        }

        if !report.merged.is_empty() {
            for action in self.actions {
                if let Err(e) = action.finish_directory(&report.merged, ledger) {
                    tracing::warn!(action = action.name(), dir = %dir.display(), error = %e, "post-merge action failed");
                }
            }
        }

        Ok(report)
    }
}

fn pending_path(accumulator: &Path) -> PathBuf {
    let mut name = accumulator.as_os_str().to_os_string();
    name.push(PENDING_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_probe::NoProbe;

    fn setup() -> (tempfile::TempDir, PathBuf, RunConfig) {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("barcode01");
        fs::create_dir_all(&input).unwrap();
        let config = RunConfig::new(temp_dir.path(), temp_dir.path().join("out"));
        (temp_dir, input, config)
    }

    #[test]
    fn test_accumulator_names_follow_barcodes() {
        let (_temp_dir, input, config) = setup();
        let processor = DirectoryProcessor::new(&config, &NoProbe, &[], Instant::now());
        let mut ledger = Ledger::new();

        let mut names = Vec::new();
        for name in ["a.fastq.gz", "b.fastq.gz", "c.fastq.gz"] {
            let file = input.join(name);
            fs::write(&file, name.as_bytes()).unwrap();
            let outcome = processor.merge_one(&mut ledger, &file, &input).unwrap();
            names.push(base_name(&outcome.merged_file));
        }

        assert_eq!(
            names,
            vec![
                "barcode01_00-00.fastq.gz".to_string(),
                "barcode01_00-01.fastq.gz".to_string(),
                "barcode01_00-02.fastq.gz".to_string(),
            ]
        );
    }

    #[test]
    fn test_accumulator_name_uses_tag_and_numeric_suffix() {
        let (_temp_dir, input, config) = setup();
        let config = config.with_name_tag("run7");
        let processor = DirectoryProcessor::new(&config, &NoProbe, &[], Instant::now());
        let ledger = Ledger::new();

        let name = processor.accumulator_name(&ledger, &input.join("FAR_pass_0004.fastq.gz"), &input);
        assert_eq!(base_name(&name), "barcode01_run7_0004-0004.fastq.gz");
        assert_eq!(name.parent().unwrap(), config.merged_dir(&input));
    }

    #[test]
    fn test_rename_mode_carries_running_total() {
        let (_temp_dir, input, config) = setup();
        let processor = DirectoryProcessor::new(&config, &NoProbe, &[], Instant::now());
        let mut ledger = Ledger::new();

        fs::write(input.join("r_00.fastq"), b"first\n").unwrap();
        fs::write(input.join("r_01.fastq"), b"second\n").unwrap();
        let report = processor.process_directory(&mut ledger, &input).unwrap();

        assert_eq!(report.merged.len(), 2);
        let first = fs::read(&report.merged[0].merged_file).unwrap();
        let second = fs::read(&report.merged[1].merged_file).unwrap();
        assert_eq!(first, b"first\n");
        assert_eq!(second, b"first\nsecond\n");
        assert!(report.merged[0].first_in_dir);
        assert!(!report.merged[1].first_in_dir);
        assert!(!report.merged[0].carries_previous);
        assert!(report.merged[1].carries_previous);
    }

    #[test]
    fn test_keep_original_name_mode() {
        let (_temp_dir, input, config) = setup();
        let config = config.with_naming(NamingMode::KeepOriginal);
        let processor = DirectoryProcessor::new(&config, &NoProbe, &[], Instant::now());
        let mut ledger = Ledger::new();

        fs::write(input.join("r_00.fastq.gz"), [0x1f, 0x8b, 0x00]).unwrap();
        fs::write(input.join("r_01.fastq.gz"), [0x1f, 0x8b, 0x01]).unwrap();
        let report = processor.process_directory(&mut ledger, &input).unwrap();

        let out = config.merged_dir(&input);
        assert_eq!(report.merged[0].merged_file, out.join("r_00.fastq.gz"));
        assert_eq!(fs::read(out.join("r_01.fastq.gz")).unwrap(), vec![0x1f, 0x8b, 0x01]);
        assert_eq!(ledger.entries()[1].sample_id, "r_01");
        assert!(report.merged.iter().all(|m| !m.carries_previous));
    }

    #[test]
    fn test_process_directory_is_idempotent() {
        let (_temp_dir, input, config) = setup();
        let processor = DirectoryProcessor::new(&config, &NoProbe, &[], Instant::now());
        let mut ledger = Ledger::new();
        fs::write(input.join("sample_0001.fastq.gz"), b"reads").unwrap();

        let first = processor.process_directory(&mut ledger, &input).unwrap();
        let merged = first.merged[0].merged_file.clone();
        let before = fs::read(&merged).unwrap();

        let second = processor.process_directory(&mut ledger, &input).unwrap();
        assert!(second.merged.is_empty());
        assert_eq!(ledger.len(), 1);
        assert_eq!(fs::read(&merged).unwrap(), before);
    }

    #[test]
    fn test_recover_pending_truncates_unrecorded_append() {
        let (_temp_dir, input, config) = setup();
        let processor = DirectoryProcessor::new(&config, &NoProbe, &[], Instant::now());
        let mut ledger = Ledger::new();
        let source = input.join("reads.fastq");
        fs::write(&source, b"ACGT\n").unwrap();

        // Simulate a crash after the append but before the ledger row.
        let destination = processor.accumulator_name(&ledger, &source, &input);
        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        fs::write(&destination, b"ACGT\n").unwrap();
        let marker = PendingMerge {
            source_file: "reads.fastq".to_string(),
            source_dir: dir_key(&input),
            accumulator: destination.clone(),
            length_before: 0,
        };
        fs::write(pending_path(&destination), serde_json::to_vec(&marker).unwrap()).unwrap();

        let report = processor.process_directory(&mut ledger, &input).unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(fs::read(&destination).unwrap(), b"ACGT\n");
        assert!(!pending_path(&destination).exists());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_merge_survives_restart_before_pass_ends() {
        let (_temp_dir, input, config) = setup();
        let processor = DirectoryProcessor::new(&config, &NoProbe, &[], Instant::now());
        let mut ledger = Ledger::new();
        fs::write(input.join("a.fastq"), b"ACGT\n").unwrap();

        let first = processor.process_directory(&mut ledger, &input).unwrap();
        let merged = first.merged[0].merged_file.clone();
        assert!(!pending_path(&merged).exists());

        // A fresh process sees only what reached disk.
        let mut reloaded = Ledger::load(&config.logs_dir()).unwrap();
        assert_eq!(reloaded.len(), 1);
        let second = processor.process_directory(&mut reloaded, &input).unwrap();
        assert!(second.merged.is_empty());
        assert_eq!(second.recovered, 0);
        assert_eq!(fs::read(&merged).unwrap(), b"ACGT\n");
    }

    #[test]
    fn test_interrupted_merge_rolls_back_after_restart() {
        let (_temp_dir, input, config) = setup();
        let processor = DirectoryProcessor::new(&config, &NoProbe, &[], Instant::now());
        let mut ledger = Ledger::new();
        fs::write(input.join("a.fastq"), b"ACGT\n").unwrap();
        fs::write(input.join("b.fastq"), b"TTTT\n").unwrap();
        processor.process_directory(&mut ledger, &input).unwrap();

        // The append of c.fastq lands but the process dies before its row is saved.
        let source = input.join("c.fastq");
        fs::write(&source, b"GGGG\n").unwrap();
        let destination = processor.accumulator_name(&ledger, &source, &input);
        let marker = PendingMerge {
            source_file: "c.fastq".to_string(),
            source_dir: dir_key(&input),
            accumulator: destination.clone(),
            length_before: 0,
        };
        fs::write(pending_path(&destination), serde_json::to_vec(&marker).unwrap()).unwrap();
        fs::write(&destination, b"ACGT\nTTTT\nGGGG\n").unwrap();

        let mut reloaded = Ledger::load(&config.logs_dir()).unwrap();
        let report = processor.process_directory(&mut reloaded, &input).unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.merged.len(), 1);
        assert_eq!(report.merged[0].merged_file, destination);
        assert_eq!(fs::read(&destination).unwrap(), b"ACGT\nTTTT\nGGGG\n");
        assert_eq!(Ledger::load(&config.logs_dir()).unwrap().len(), 3);
    }

    #[test]
    fn test_marker_for_recorded_source_is_discarded() {
        let (_temp_dir, input, config) = setup();
        let processor = DirectoryProcessor::new(&config, &NoProbe, &[], Instant::now());
        let mut ledger = Ledger::new();
        let source = input.join("reads.fastq");
        fs::write(&source, b"ACGT\n").unwrap();
        let outcome = processor.merge_one(&mut ledger, &source, &input).unwrap();

        let marker = PendingMerge {
            source_file: "reads.fastq".to_string(),
            source_dir: dir_key(&input),
            accumulator: outcome.merged_file.clone(),
            length_before: 0,
        };
        fs::write(pending_path(&outcome.merged_file), serde_json::to_vec(&marker).unwrap()).unwrap();

        assert_eq!(processor.recover_pending(&ledger, &input).unwrap(), 0);
        assert_eq!(fs::read(&outcome.merged_file).unwrap(), b"ACGT\n");
        assert!(!pending_path(&outcome.merged_file).exists());
    }
}
