use crate::actions::ProcessAction;
use crate::config::{OpenFileCheck, RunConfig};
use crate::depth::{detect_layout, directories_for, Layout};
use crate::handoff::{sleep_or_stop, stop_requested, HandoffToken};
use crate::ledger::Ledger;
use crate::metadata::export_ledger_metadata;
use crate::open_probe::{platform_probe, NoProbe, OpenFileProbe};
use crate::processor::DirectoryProcessor;
use crate::HandlerError;
use crossbeam_channel::Receiver;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

/// Summary of one pass over the watch root.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub layout: Layout,
    pub directories: Vec<PathBuf>,
    pub merged: usize,
    pub skipped_open: usize,
    pub recovered: usize,
    /// Directories whose pass failed; they are retried next pass.
    pub failed: Vec<PathBuf>,
}

impl PassReport {
    fn new(layout: Layout) -> Self {
        Self {
            layout,
            directories: Vec::new(),
            merged: 0,
            skipped_open: 0,
            recovered: 0,
            failed: Vec::new(),
        }
    }
}

/// Drives repeated passes over the input tree and owns the ledger.
pub struct PassOrchestrator {
    config: RunConfig,
    ledger: Ledger,
    probe: Box<dyn OpenFileProbe>,
    actions: Vec<Box<dyn ProcessAction>>,
    started: Instant,
    last_report: Option<PassReport>,
}

impl PassOrchestrator {
    /// Validates the configuration and loads the ledger from `<output>/logs`.
    pub fn new(config: RunConfig, actions: Vec<Box<dyn ProcessAction>>) -> Result<Self, HandlerError> {
        let probe: Box<dyn OpenFileProbe> = match config.open_file_check {
            OpenFileCheck::Auto => platform_probe(),
            OpenFileCheck::Off => Box::new(NoProbe),
        };
        Self::with_probe(config, actions, probe)
    }

    pub fn with_probe(
        config: RunConfig,
        actions: Vec<Box<dyn ProcessAction>>,
        probe: Box<dyn OpenFileProbe>,
    ) -> Result<Self, HandlerError> {
        config.validate()?;
        let orchestrator = Self {
            ledger: Ledger::load(&config.logs_dir())?,
            config,
            probe,
            actions,
            started: Instant::now(),
            last_report: None,
        };
        orchestrator.prep_dirs()?;
        Ok(orchestrator)
    }

    /// Creates the output, log and metadata directories.
    pub fn prep_dirs(&self) -> Result<(), HandlerError> {
        fs::create_dir_all(&self.config.output_dir)?;
        fs::create_dir_all(self.config.logs_dir())?;
        fs::create_dir_all(self.config.metadata_dir())?;
        Ok(())
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn last_report(&self) -> Option<&PassReport> {
        self.last_report.as_ref()
    }

    /// Deletes every ledger row and rewrites the empty ledger.
    pub fn clear_ledger(&mut self) -> Result<(), HandlerError> {
        self.ledger.clear();
        self.ledger.flush(&self.config.logs_dir())?;
        Ok(())
    }

    /// Detects the layout, processes every directory and flushes the ledger.
    ///
    /// A failing directory is logged and skipped; its unrecorded files are
    /// picked up again next pass.
    pub fn run_pass(&mut self) -> Result<PassReport, HandlerError> {
        let root = self.config.input_dir.clone();
        let layout = detect_layout(&root)?;
        let mut report = PassReport::new(layout);

        if layout == Layout::Empty {
            tracing::info!(root = %root.display(), "no sequence files yet");
        }

        let processor = DirectoryProcessor::new(&self.config, self.probe.as_ref(), &self.actions, self.started);
        for dir in directories_for(&root, layout)? {
            match processor.process_directory(&mut self.ledger, &dir) {
                Ok(dir_report) => {
                    report.merged += dir_report.merged.len();
                    report.skipped_open += dir_report.skipped_open;
                    report.recovered += dir_report.recovered;
                }
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "directory pass failed");
                    report.failed.push(dir.clone());
                }
            }
            report.directories.push(dir);
        }

        self.ledger.flush(&self.config.logs_dir())?;
        export_ledger_metadata(&self.ledger, &self.config.metadata_dir())?;

        tracing::info!(
            layout = %report.layout,
            directories = report.directories.len(),
            merged = report.merged,
            skipped_open = report.skipped_open,
            "pass finished"
        );
        self.last_report = Some(report.clone());
        Ok(report)
    }

    /// Runs passes separated by the configured sleep until `stop` fires.
    ///
    /// With a token, each pass runs only while `own` holds it and hands it to
    /// `peer` afterwards. The pass in flight always completes.
    pub fn run_until_stopped(
        &mut self,
        stop: &Receiver<()>,
        token: Option<(&HandoffToken, &str, &str)>,
    ) -> Result<usize, HandlerError> {
        let mut passes = 0;
        while !stop_requested(stop) {
            if let Some((token, own, _)) = token {
                if !token.acquire_or_stop(own, stop) {
                    break;
                }
            }

            let outcome = self.run_pass();
            if let Some((token, _, peer)) = token {
                token.release_to(peer);
            }
            outcome?;
            passes += 1;

            if sleep_or_stop(stop, self.config.sleep) {
                break;
            }
        }
        tracing::info!(passes, "watch loop stopped");
        Ok(passes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::path::Path;
    use std::time::Duration;

    /// Reports a fixed set of file names as open.
    struct HeldOpen(Vec<String>);

    impl OpenFileProbe for HeldOpen {
        fn is_open(&self, path: &Path) -> bool {
            self.0.iter().any(|name| path.ends_with(name))
        }
    }

    fn orchestrator(input: &Path, output: &Path) -> PassOrchestrator {
        let config = RunConfig::new(input, output).with_sleep(Duration::from_millis(10));
        PassOrchestrator::with_probe(config, Vec::new(), Box::new(NoProbe)).unwrap()
    }

    #[test]
    fn test_new_rejects_missing_input() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = RunConfig::new(temp_dir.path().join("missing"), temp_dir.path().join("out"));
        let err = PassOrchestrator::new(config, Vec::new()).err().unwrap();
        assert!(err.is_config());
        assert!(!temp_dir.path().join("out").exists());
    }

    #[test]
    fn test_empty_root_pass() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("in");
        fs::create_dir(&input).unwrap();
        let mut orch = orchestrator(&input, &temp_dir.path().join("out"));

        let report = orch.run_pass().unwrap();
        assert_eq!(report.layout, Layout::Empty);
        assert!(report.directories.is_empty());
        assert!(orch.config().logs_dir().join("processed.tsv").exists());
    }

    #[test]
    fn test_flat_layout_names_after_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("fastq_pass");
        fs::create_dir(&input).unwrap();
        File::create(input.join("r_0001.fastq.gz")).unwrap();
        let mut orch = orchestrator(&input, &temp_dir.path().join("out"));

        let report = orch.run_pass().unwrap();
        assert_eq!(report.layout, Layout::Flat);
        assert_eq!(report.merged, 1);
        assert!(temp_dir
            .path()
            .join("out/fastq_pass/merged_files/fastq_pass_0001-0001.fastq.gz")
            .exists());
    }

    #[test]
    fn test_sharded_pass_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("in");
        for barcode in ["barcode01", "barcode02"] {
            fs::create_dir_all(input.join(barcode)).unwrap();
            fs::write(input.join(barcode).join("a.fastq"), barcode.as_bytes()).unwrap();
        }
        let mut orch = orchestrator(&input, &temp_dir.path().join("out"));

        let first = orch.run_pass().unwrap();
        assert_eq!(first.layout, Layout::Sharded);
        assert_eq!(first.merged, 2);

        let second = orch.run_pass().unwrap();
        assert_eq!(second.merged, 0);
        assert_eq!(orch.ledger().len(), 2);
        assert!(orch.config().metadata_dir().join("fastq_metadata.tsv").exists());
    }

    #[test]
    fn test_open_file_waits_for_next_pass() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("in");
        fs::create_dir(&input).unwrap();
        fs::write(input.join("a.fastq"), b"a").unwrap();
        fs::write(input.join("b.fastq"), b"b").unwrap();

        let config = RunConfig::new(&input, temp_dir.path().join("out"));
        let mut orch =
            PassOrchestrator::with_probe(config.clone(), Vec::new(), Box::new(HeldOpen(vec!["b.fastq".to_string()])))
                .unwrap();
        let report = orch.run_pass().unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.skipped_open, 1);
        drop(orch);

        let mut orch = PassOrchestrator::with_probe(config, Vec::new(), Box::new(NoProbe)).unwrap();
        assert_eq!(orch.ledger().len(), 1);
        assert_eq!(orch.run_pass().unwrap().merged, 1);
        assert_eq!(orch.ledger().len(), 2);
    }

    #[test]
    fn test_run_until_stopped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("in");
        fs::create_dir(&input).unwrap();
        let mut orch = orchestrator(&input, &temp_dir.path().join("out"));

        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            drop(tx);
        });
        assert!(orch.run_until_stopped(&rx, None).unwrap() >= 1);
        stopper.join().unwrap();

        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        tx.send(()).unwrap();
        assert_eq!(orch.run_until_stopped(&rx, None).unwrap(), 0);
    }

    #[test]
    fn test_clear_ledger() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("in");
        fs::create_dir(&input).unwrap();
        fs::write(input.join("a.fastq"), b"a").unwrap();
        let mut orch = orchestrator(&input, &temp_dir.path().join("out"));
        orch.run_pass().unwrap();

        orch.clear_ledger().unwrap();
        assert!(orch.ledger().is_empty());
        assert!(Ledger::load(&orch.config().logs_dir()).unwrap().is_empty());
    }
}
