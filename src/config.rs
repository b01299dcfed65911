use crate::remote::UploadStrategy;
use crate::seq_files::base_name;
use crate::HandlerError;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LOGS_DIRNAME: &str = "logs";
pub const METADATA_DIRNAME: &str = "metadata_dir";
pub const RESULTS_DIRNAME: &str = "results";
pub const MERGED_DIRNAME: &str = "merged_files";

/// How accumulator files are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingMode {
    /// `<prefix>[_<tag>]_<first>-<current>.fastq.gz`, a new name per merge.
    #[default]
    Rename,
    /// One output per source file, reusing the source base name.
    KeepOriginal,
}

/// Post-merge behaviours, run in the order given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ActionKind {
    /// Append the last accumulator of the same sample from another directory.
    MergeWithLast,
    /// Write a one-row metadata sidecar next to each accumulator.
    Metadata,
    /// Push accumulator and sidecar through the remote channel.
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OpenFileCheck {
    /// Use the platform probe where one exists.
    #[default]
    Auto,
    /// Treat every file as closed.
    Off,
}

/// Remote side of the upload and status loops.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Root of the mirror the channel writes into.
    pub remote_root: PathBuf,
    /// Directory under the remote root that receives uploads.
    pub remote_dir: String,
    pub strategy: UploadStrategy,
    /// Status query, `{sample}` is replaced by the sample id.
    pub status_command: Option<String>,
    /// Remote directory holding result artifacts, named after the sample id.
    pub remote_results_dir: Option<String>,
}

impl UploadConfig {
    pub fn new(remote_root: PathBuf) -> Self {
        Self {
            remote_root,
            remote_dir: "uploads".to_string(),
            strategy: UploadStrategy::Last,
            status_command: None,
            remote_results_dir: None,
        }
    }
}

/// Everything one watch run needs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub sleep: Duration,
    pub name_tag: String,
    pub naming: NamingMode,
    pub actions: Vec<ActionKind>,
    pub open_file_check: OpenFileCheck,
    pub upload: Option<UploadConfig>,
}

impl RunConfig {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            sleep: Duration::from_secs(600),
            name_tag: String::new(),
            naming: NamingMode::Rename,
            actions: Vec::new(),
            open_file_check: OpenFileCheck::Auto,
            upload: None,
        }
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_name_tag(mut self, tag: &str) -> Self {
        self.name_tag = tag.trim().to_string();
        self
    }

    pub fn with_naming(mut self, naming: NamingMode) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_actions(mut self, actions: Vec<ActionKind>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_open_file_check(mut self, check: OpenFileCheck) -> Self {
        self.open_file_check = check;
        self
    }

    pub fn with_upload(mut self, upload: UploadConfig) -> Self {
        self.upload = Some(upload);
        self
    }

    /// Holds `processed.tsv` and the upload log.
    pub fn logs_dir(&self) -> PathBuf {
        self.output_dir.join(LOGS_DIRNAME)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.output_dir.join(METADATA_DIRNAME)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.output_dir.join(RESULTS_DIRNAME)
    }

    /// `<output>/<basename(source_dir)>/merged_files`
    pub fn merged_dir(&self, source_dir: &Path) -> PathBuf {
        self.output_dir.join(base_name(source_dir)).join(MERGED_DIRNAME)
    }

    /// Startup checks; nothing runs when this fails.
    pub fn validate(&self) -> Result<(), HandlerError> {
        if !self.input_dir.exists() {
            return Err(HandlerError::Config(format!(
                "input directory {} does not exist",
                self.input_dir.display()
            )));
        }
        if !self.input_dir.is_dir() {
            return Err(HandlerError::Config(format!(
                "input path {} is not a directory",
                self.input_dir.display()
            )));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(HandlerError::Config("output directory is empty".to_string()));
        }
        if self.sleep.is_zero() {
            return Err(HandlerError::Config("sleep interval must be positive".to_string()));
        }
        if self.name_tag.contains(std::path::MAIN_SEPARATOR) {
            return Err(HandlerError::Config(format!(
                "name tag '{}' must not contain a path separator",
                self.name_tag
            )));
        }
        if self.actions.contains(&ActionKind::Upload) && self.upload.is_none() {
            return Err(HandlerError::Config(
                "upload action requested without a remote root".to_string(),
            ));
        }
        if let Some(upload) = &self.upload {
            if let UploadStrategy::Step(0) = upload.strategy {
                return Err(HandlerError::Config("upload step must be greater than zero".to_string()));
            }
        }
        Ok(())
    }
}
