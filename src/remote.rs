use crate::actions::ProcessAction;
use crate::config::RunConfig;
use crate::handoff::{sleep_or_stop, stop_requested, HandoffToken};
use crate::ledger::Ledger;
use crate::metadata::{sidecar_path, write_metadata, MetadataEntry};
use crate::processor::MergeOutcome;
use crate::seq_files::{base_name, is_sequence_file};
use crate::HandlerError;
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const UPLOAD_LOG_FILE: &str = "upload_log.tsv";

/// Remote execution and file transfer used by the upload and status loops.
pub trait RemoteChannel: Send + Sync {
    fn execute_command(&self, command: &str) -> Result<String, HandlerError>;
    fn check_file_exists(&self, remote_path: &str) -> Result<bool, HandlerError>;
    fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<(), HandlerError>;
    fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<(), HandlerError>;
}

/// A channel whose remote side is a local or mounted directory tree.
#[derive(Debug, Clone)]
pub struct MirrorChannel {
    root: PathBuf,
}

impl MirrorChannel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, remote_path: &str) -> Result<PathBuf, HandlerError> {
        let relative = Path::new(remote_path.trim_start_matches('/'));
        if relative.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(HandlerError::Remote(format!("remote path {} escapes the mirror root", remote_path)));
        }
        Ok(self.root.join(relative))
    }
}

fn copy_atomically(from: &Path, to: &Path) -> Result<(), HandlerError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut temp_name = to.as_os_str().to_os_string();
    temp_name.push(".part");
    let temp_path = PathBuf::from(temp_name);

    let mut source = File::open(from)?;
    let mut destination = File::create(&temp_path)?;
    std::io::copy(&mut source, &mut destination)?;
    destination.sync_all()?;
    fs::rename(&temp_path, to)?;
    Ok(())
}

/// Result files are named `<sample_id>` followed by `_`, `.` or `-`.
fn is_result_for(name: &str, sample_id: &str) -> bool {
    match name.strip_prefix(sample_id) {
        Some(rest) => rest.is_empty() || rest.starts_with(['_', '.', '-']),
        None => false,
    }
}

impl RemoteChannel for MirrorChannel {
    fn execute_command(&self, command: &str) -> Result<String, HandlerError> {
        fs::create_dir_all(&self.root)?;
        let output = Command::new("sh").arg("-c").arg(command).current_dir(&self.root).output()?;
        if !output.status.success() {
            return Err(HandlerError::Remote(format!(
                "'{}' exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn check_file_exists(&self, remote_path: &str) -> Result<bool, HandlerError> {
        Ok(self.resolve(remote_path)?.is_file())
    }

    fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<(), HandlerError> {
        copy_atomically(local_path, &self.resolve(remote_path)?)
    }

    fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<(), HandlerError> {
        copy_atomically(&self.resolve(remote_path)?, local_path)
    }
}

/// Which accumulators of a directory lineage get uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadStrategy {
    All,
    /// Only the newest accumulator after each directory pass.
    #[default]
    Last,
    /// Every n-th ledger row of the directory, starting with the first.
    Step(usize),
    None,
}

impl UploadStrategy {
    /// Whether the row at `index` among `count` rows is selected.
    pub fn is_to_upload(&self, count: usize, index: usize) -> bool {
        match self {
            UploadStrategy::All => true,
            UploadStrategy::Last => count > 0 && index == count - 1,
            UploadStrategy::Step(step) => *step > 0 && index % step == 0,
            UploadStrategy::None => false,
        }
    }
}

impl fmt::Display for UploadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStrategy::All => write!(f, "all"),
            UploadStrategy::Last => write!(f, "last"),
            UploadStrategy::Step(step) => write!(f, "step:{}", step),
            UploadStrategy::None => write!(f, "none"),
        }
    }
}

impl FromStr for UploadStrategy {
    type Err = HandlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(UploadStrategy::All),
            "last" => Ok(UploadStrategy::Last),
            "none" => Ok(UploadStrategy::None),
            other => match other.strip_prefix("step:").map(str::parse::<usize>) {
                Some(Ok(step)) => Ok(UploadStrategy::Step(step)),
                _ => Err(HandlerError::Config(format!(
                    "unknown upload strategy '{}', expected all, last, none or step:N",
                    s
                ))),
            },
        }
    }
}

/// Lifecycle of an uploaded file on the remote platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Missing,
    Uploading,
    Uploaded,
    Submitted,
    Processing,
    Processed,
    SubmissionError,
    Error,
}

impl SampleStatus {
    /// Maps the text printed by a status command to a status.
    pub fn classify(output: &str) -> Self {
        let text = output.to_lowercase();
        if text.contains("does not exist") || text.contains("not found") {
            SampleStatus::Missing
        } else if text.contains("is ready") {
            if text.contains("true") {
                SampleStatus::Uploaded
            } else {
                SampleStatus::Uploading
            }
        } else if text.contains("submission error") {
            SampleStatus::SubmissionError
        } else if text.contains("error") {
            SampleStatus::Error
        } else if text.contains("processed") || text.contains("finished") {
            SampleStatus::Processed
        } else if text.contains("processing") || text.contains("running") {
            SampleStatus::Processing
        } else if text.contains("submitted") {
            SampleStatus::Submitted
        } else {
            SampleStatus::Error
        }
    }

    /// Whether an upload should be (re)attempted from this state.
    pub fn needs_upload(&self) -> bool {
        matches!(self, SampleStatus::Missing | SampleStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadLogEntry {
    pub sample_id: String,
    pub barcode: String,
    pub file_path: String,
    pub remote_path: String,
    pub status: SampleStatus,
    #[serde(default)]
    pub tag: String,
}

/// Every upload attempt, one row per local file.
#[derive(Debug, Default, Clone)]
pub struct UploadLog {
    entries: Vec<UploadLogEntry>,
}

impl UploadLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(dir: &Path) -> Result<Self, HandlerError> {
        let path = dir.join(UPLOAD_LOG_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(HandlerError::Io(e)),
        };

        let mut reader = csv::ReaderBuilder::new().delimiter(b'\t').from_reader(file);
        let mut log = Self::new();
        for row in reader.deserialize() {
            log.record(row?);
        }
        Ok(log)
    }

    pub fn flush(&self, dir: &Path) -> Result<PathBuf, HandlerError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(UPLOAD_LOG_FILE);
        let temp_path = dir.join(format!("{}.tmp", UPLOAD_LOG_FILE));
        {
            let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(&temp_path)?;
            for entry in &self.entries {
                writer.serialize(entry)?;
            }
            writer.flush()?;
        }
        fs::rename(&temp_path, &path)?;
        Ok(path)
    }

    pub fn entries(&self) -> &[UploadLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a row, or replaces the row already held for the same file.
    pub fn record(&mut self, entry: UploadLogEntry) {
        match self.entries.iter_mut().find(|e| e.file_path == entry.file_path) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Returns false when `file_path` has never been logged.
    pub fn update_status(&mut self, file_path: &str, status: SampleStatus) -> bool {
        match self.entries.iter_mut().find(|e| e.file_path == file_path) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    pub fn status_of(&self, file_path: &str) -> Option<SampleStatus> {
        self.entries.iter().find(|e| e.file_path == file_path).map(|e| e.status)
    }

    /// Rows for read files, leaving out metadata sidecars.
    pub fn fastq_entries(&self) -> impl Iterator<Item = &UploadLogEntry> {
        self.entries.iter().filter(|e| is_sequence_file(&base_name(Path::new(&e.file_path))))
    }
}

fn lock_log(log: &Mutex<UploadLog>) -> MutexGuard<'_, UploadLog> {
    log.lock().unwrap_or_else(|e| e.into_inner())
}

/// Pushes accumulators and their metadata sidecars through a [`RemoteChannel`].
pub struct UploadAction {
    channel: Arc<dyn RemoteChannel>,
    log: Arc<Mutex<UploadLog>>,
    strategy: UploadStrategy,
    remote_dir: String,
    metadata_dir: PathBuf,
    logs_dir: PathBuf,
    tag: String,
}

impl UploadAction {
    pub fn new(channel: Arc<dyn RemoteChannel>, log: Arc<Mutex<UploadLog>>, config: &RunConfig) -> Result<Self, HandlerError> {
        let upload = config
            .upload
            .as_ref()
            .ok_or_else(|| HandlerError::Config("upload action needs upload settings".to_string()))?;
        Ok(Self {
            channel,
            log,
            strategy: upload.strategy,
            remote_dir: upload.remote_dir.trim_end_matches('/').to_string(),
            metadata_dir: config.metadata_dir(),
            logs_dir: config.logs_dir(),
            tag: config.name_tag.clone(),
        })
    }

    pub fn remote_path(&self, local_path: &Path) -> String {
        format!("{}/{}", self.remote_dir, base_name(local_path))
    }

    /// Uploads one file unless the remote already has it. Remote failures
    /// become an `Error` row, never an `Err`.
    fn upload_one(&self, local_path: &Path, sample_id: &str, barcode: &str) -> SampleStatus {
        let remote_path = self.remote_path(local_path);
        let status = match self.channel.check_file_exists(&remote_path) {
            Ok(true) => {
                tracing::info!(file = %local_path.display(), "already on remote");
                SampleStatus::Uploaded
            }
            _ => match self.channel.upload_file(local_path, &remote_path) {
                Ok(()) => {
                    tracing::info!(file = %local_path.display(), remote = %remote_path, "uploaded");
                    SampleStatus::Uploaded
                }
                Err(e) => {
                    tracing::warn!(file = %local_path.display(), error = %e, "upload failed");
                    SampleStatus::Error
                }
            },
        };

        lock_log(&self.log).record(UploadLogEntry {
            sample_id: sample_id.to_string(),
            barcode: barcode.to_string(),
            file_path: local_path.to_string_lossy().into_owned(),
            remote_path,
            status,
            tag: self.tag.clone(),
        });
        status
    }

    fn upload_outcome(&self, outcome: &MergeOutcome, ledger: &Ledger) -> Result<(), HandlerError> {
        let merged_text = outcome.merged_file.to_string_lossy();
        let previous = lock_log(&self.log).status_of(&merged_text);
        if let Some(status) = previous {
            if !status.needs_upload() {
                return Ok(());
            }
        }

        let sidecar = sidecar_path(&self.metadata_dir, &outcome.merged_file);
        if !sidecar.exists() {
            let entry = ledger
                .lookup(&outcome.source_file.to_string_lossy(), &outcome.source_dir)
                .ok_or_else(|| HandlerError::Ledger(format!("{} not recorded", outcome.source_file.display())))?;
            write_metadata(&sidecar, &[MetadataEntry::from_ledger_entry(entry)])?;
        }

        self.upload_one(&outcome.merged_file, &outcome.sample_id, &outcome.barcode);
        self.upload_one(&sidecar, &outcome.sample_id, &outcome.barcode);
        lock_log(&self.log).flush(&self.logs_dir)?;
        Ok(())
    }
}

impl ProcessAction for UploadAction {
    fn name(&self) -> &str {
        "upload"
    }

    fn process(&self, outcome: &MergeOutcome, ledger: &Ledger) -> Result<(), HandlerError> {
        let selected = match self.strategy {
            UploadStrategy::All => true,
            UploadStrategy::Step(_) => {
                let count = ledger.entries_for_dir(&outcome.source_dir).count();
                self.strategy.is_to_upload(count, count.saturating_sub(1))
            }
            UploadStrategy::Last | UploadStrategy::None => false,
        };
        if selected {
            self.upload_outcome(outcome, ledger)?;
        }
        Ok(())
    }

    fn finish_directory(&self, merged: &[MergeOutcome], ledger: &Ledger) -> Result<(), HandlerError> {
        if self.strategy != UploadStrategy::Last {
            return Ok(());
        }
        match merged.last() {
            Some(outcome) => self.upload_outcome(outcome, ledger),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub checked: usize,
    pub processed: usize,
    pub downloaded: usize,
}

/// Companion loop that asks the remote for sample status and fetches results.
pub struct StatusPoller {
    channel: Arc<dyn RemoteChannel>,
    log: Arc<Mutex<UploadLog>>,
    status_command: Option<String>,
    remote_results_dir: Option<String>,
    results_dir: PathBuf,
    logs_dir: PathBuf,
}

impl StatusPoller {
    pub fn new(channel: Arc<dyn RemoteChannel>, log: Arc<Mutex<UploadLog>>, config: &RunConfig) -> Self {
        let upload = config.upload.as_ref();
        Self {
            channel,
            log,
            status_command: upload.and_then(|u| u.status_command.clone()),
            remote_results_dir: upload.and_then(|u| u.remote_results_dir.clone()),
            results_dir: config.results_dir(),
            logs_dir: config.logs_dir(),
        }
    }

    fn query_status(&self, template: &str, sample_id: &str) -> SampleStatus {
        let command = template.replace("{sample}", sample_id);
        match self.channel.execute_command(&command) {
            Ok(output) => SampleStatus::classify(&output),
            Err(e) => {
                tracing::warn!(sample = %sample_id, error = %e, "status query failed");
                SampleStatus::Error
            }
        }
    }

    /// Copies `<remote results dir>/<sample_id>*` into the local results directory.
    pub fn download_results(&self, sample_id: &str) -> Result<usize, HandlerError> {
        let Some(remote_dir) = &self.remote_results_dir else {
            return Ok(0);
        };
        let listing = self.channel.execute_command(&format!("ls -1 {}", remote_dir))?;

        let mut downloaded = 0;
        for name in listing.lines().map(str::trim).filter(|n| is_result_for(n, sample_id)) {
            let local_path = self.results_dir.join(name);
            if local_path.exists() {
                continue;
            }
            self.channel.download_file(&format!("{}/{}", remote_dir, name), &local_path)?;
            tracing::info!(sample = %sample_id, file = %local_path.display(), "result downloaded");
            downloaded += 1;
        }
        Ok(downloaded)
    }

    /// One round over every uploaded read file not yet processed.
    pub fn poll_once(&self) -> Result<PollReport, HandlerError> {
        let mut report = PollReport::default();
        let Some(template) = &self.status_command else {
            return Ok(report);
        };

        let pending: Vec<UploadLogEntry> = lock_log(&self.log)
            .fastq_entries()
            .filter(|e| e.status != SampleStatus::Processed)
            .cloned()
            .collect();

        for entry in pending {
            let status = self.query_status(template, &entry.sample_id);
            lock_log(&self.log).update_status(&entry.file_path, status);
            report.checked += 1;

            if status == SampleStatus::Processed {
                report.processed += 1;
                match self.download_results(&entry.sample_id) {
                    Ok(n) => report.downloaded += n,
                    Err(e) => tracing::warn!(sample = %entry.sample_id, error = %e, "result download failed"),
                }
            }
        }

        lock_log(&self.log).flush(&self.logs_dir)?;
        tracing::info!(checked = report.checked, processed = report.processed, "status poll finished");
        Ok(report)
    }

    /// Polls every `interval` until `stop` fires. With a token, each round
    /// runs only while `own` holds it and hands it to `peer` afterwards.
    pub fn run(&self, stop: &Receiver<()>, interval: Duration, token: Option<(&HandoffToken, &str, &str)>) {
        while !stop_requested(stop) {
            if let Some((token, own, _)) = token {
                if !token.acquire_or_stop(own, stop) {
                    break;
                }
            }
            if let Err(e) = self.poll_once() {
                tracing::warn!(error = %e, "status poll failed");
            }
            if let Some((token, _, peer)) = token {
                token.release_to(peer);
            }
            if sleep_or_stop(stop, interval) {
                break;
            }
        }
        tracing::info!("status poller stopped");
    }
}
