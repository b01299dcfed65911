use crate::config::{ActionKind, RunConfig};
use crate::ledger::Ledger;
use crate::metadata::{sidecar_path, write_metadata, MetadataEntry};
use crate::processor::MergeOutcome;
use crate::remote::UploadAction;
use crate::HandlerError;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Behaviour run after a source file has been merged and recorded.
pub trait ProcessAction: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, outcome: &MergeOutcome, ledger: &Ledger) -> Result<(), HandlerError>;

    /// Called once per directory after all of its new files were merged.
    fn finish_directory(&self, _merged: &[MergeOutcome], _ledger: &Ledger) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Appends the bytes of `from` onto `to`.
pub fn append_file(from: &Path, to: &Path) -> Result<u64, HandlerError> {
    let mut source = File::open(from)?;
    let mut destination = OpenOptions::new().create(true).append(true).open(to)?;
    let copied = io::copy(&mut source, &mut destination)?;
    destination.sync_all()?;
    Ok(copied)
}

/// Stitches the latest accumulator of the same sample from another
/// directory onto the new accumulator.
///
/// An accumulator that already carries an earlier one of its directory is
/// skipped, since the stitch travelled with that copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeWithLast;

impl ProcessAction for MergeWithLast {
    fn name(&self) -> &str {
        "merge-with-last"
    }

    fn process(&self, outcome: &MergeOutcome, ledger: &Ledger) -> Result<(), HandlerError> {
        if outcome.carries_previous {
            return Ok(());
        }

        let last = ledger.last_merged_for_sample_outside(&outcome.sample_id, Some(&outcome.source_dir));
        if last.is_empty() || Path::new(&last) == outcome.merged_file {
            return Ok(());
        }

        let copied = append_file(Path::new(&last), &outcome.merged_file)?;
        tracing::info!(
            sample = %outcome.sample_id,
            from = %last,
            into = %outcome.merged_file.display(),
            bytes = copied,
            "stitched previous run"
        );
        Ok(())
    }
}

/// Writes a one-row metadata table next to every new accumulator.
#[derive(Debug, Clone)]
pub struct MetadataSidecar {
    metadata_dir: PathBuf,
}

impl MetadataSidecar {
    pub fn new(metadata_dir: PathBuf) -> Self {
        Self { metadata_dir }
    }
}

impl ProcessAction for MetadataSidecar {
    fn name(&self) -> &str {
        "metadata"
    }

    fn process(&self, outcome: &MergeOutcome, ledger: &Ledger) -> Result<(), HandlerError> {
        let entry = ledger
            .lookup(&outcome.source_file.to_string_lossy(), &outcome.source_dir)
            .ok_or_else(|| HandlerError::Ledger(format!("{} not recorded", outcome.source_file.display())))?;

        let path = sidecar_path(&self.metadata_dir, &outcome.merged_file);
        write_metadata(&path, &[MetadataEntry::from_ledger_entry(entry)])?;
        tracing::debug!(path = %path.display(), "metadata sidecar written");
        Ok(())
    }
}

/// Builds the configured actions in order. `upload` is required when an
/// upload action is listed.
pub fn build_actions(config: &RunConfig, upload: Option<UploadAction>) -> Result<Vec<Box<dyn ProcessAction>>, HandlerError> {
    let mut upload = upload;
    let mut actions: Vec<Box<dyn ProcessAction>> = Vec::new();

    for kind in &config.actions {
        match kind {
            ActionKind::MergeWithLast => actions.push(Box::new(MergeWithLast)),
            ActionKind::Metadata => actions.push(Box::new(MetadataSidecar::new(config.metadata_dir()))),
            ActionKind::Upload => {
                let action = upload
                    .take()
                    .ok_or_else(|| HandlerError::Config("upload action listed without an uploader".to_string()))?;
                actions.push(Box::new(action));
            }
        }
    }

    Ok(actions)
}
