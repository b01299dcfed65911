use clap::Parser;
use crossbeam_channel::Sender;
use dotenv::dotenv;
use fastq_handler::actions::build_actions;
use fastq_handler::config::{ActionKind, NamingMode, OpenFileCheck, RunConfig, UploadConfig};
use fastq_handler::handoff::HandoffToken;
use fastq_handler::orchestrator::{PassOrchestrator, PassReport};
use fastq_handler::remote::{MirrorChannel, RemoteChannel, StatusPoller, UploadAction, UploadLog};
use fastq_handler::HandlerError;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const MERGE_WORKER: &str = "merge";
const POLL_WORKER: &str = "poll";

#[derive(Parser)]
#[command(name = "fastq_handler")]
#[command(about = "Incrementally merge sequencing read files as the instrument writes them", long_about = None)]
struct Cli {
    /// Directory the instrument writes read files into
    #[arg(long, env = "FASTQ_HANDLER_IN_DIR")]
    in_dir: PathBuf,
    /// Directory receiving accumulators, logs and metadata
    #[arg(long, env = "FASTQ_HANDLER_OUT_DIR")]
    out_dir: PathBuf,
    /// Seconds between passes
    #[arg(long, env = "FASTQ_HANDLER_SLEEP", default_value_t = 600)]
    sleep: u64,
    /// Extra tag inserted into accumulator names
    #[arg(long, env = "FASTQ_HANDLER_TAG", default_value = "")]
    tag: String,
    /// Keep source file names instead of growing renamed accumulators
    #[arg(long)]
    keep_names: bool,
    /// Post-merge action, repeat to run several in order
    #[arg(long = "action", value_enum)]
    actions: Vec<ActionKind>,
    #[arg(long, value_enum, default_value = "auto")]
    open_file_check: OpenFileCheck,
    /// Run a single pass and exit
    #[arg(long)]
    once: bool,
    /// Write the last pass summary as JSON
    #[arg(long)]
    status_json: Option<PathBuf>,
    /// Root of the remote mirror; enables uploads and status polling
    #[arg(long, env = "FASTQ_HANDLER_REMOTE_ROOT")]
    remote_root: Option<PathBuf>,
    #[arg(long, default_value = "uploads")]
    remote_dir: String,
    /// all, last, none or step:N
    #[arg(long, default_value = "last")]
    upload_strategy: String,
    /// Status query run on the remote, `{sample}` is replaced by the sample id
    #[arg(long)]
    status_command: Option<String>,
    /// Remote directory holding result files named after the sample id
    #[arg(long)]
    remote_results_dir: Option<String>,
    /// Seconds between status polls
    #[arg(long, default_value_t = 300)]
    poll_interval: u64,
}

fn build_config(cli: &Cli) -> Result<RunConfig, HandlerError> {
    let mut config = RunConfig::new(&cli.in_dir, &cli.out_dir)
        .with_sleep(Duration::from_secs(cli.sleep))
        .with_name_tag(&cli.tag)
        .with_actions(cli.actions.clone())
        .with_open_file_check(cli.open_file_check);
    if cli.keep_names {
        config = config.with_naming(NamingMode::KeepOriginal);
    }

    if let Some(root) = &cli.remote_root {
        let mut upload = UploadConfig::new(root.clone());
        upload.remote_dir = cli.remote_dir.clone();
        upload.strategy = cli.upload_strategy.parse()?;
        upload.status_command = cli.status_command.clone();
        upload.remote_results_dir = cli.remote_results_dir.clone();
        config = config.with_upload(upload);
    }
    Ok(config)
}

/// Drops `stop` on Ctrl-C, which stops every worker holding a receiver.
fn spawn_ctrl_c(stop: Sender<()>) -> Result<(), HandlerError> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    thread::Builder::new().name("ctrl-c".to_string()).spawn(move || {
        match runtime.block_on(tokio::signal::ctrl_c()) {
            Ok(()) => {
                tracing::info!("interrupt received, finishing the current pass");
                drop(stop);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for Ctrl-C");
                loop {
                    thread::park();
                }
            }
        }
    })?;
    Ok(())
}

fn write_status_json(path: &Path, report: &PassReport) -> Result<(), HandlerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(report)?)?;
    Ok(())
}

fn run(cli: Cli) -> Result<(), HandlerError> {
    let config = build_config(&cli)?;
    config.validate()?;

    let mut upload_action = None;
    let mut poller = None;
    if let Some(upload) = &config.upload {
        let channel: Arc<dyn RemoteChannel> = Arc::new(MirrorChannel::new(upload.remote_root.clone()));
        let log = Arc::new(Mutex::new(UploadLog::load(&config.logs_dir())?));
        if config.actions.contains(&ActionKind::Upload) {
            upload_action = Some(UploadAction::new(channel.clone(), log.clone(), &config)?);
        }
        if upload.status_command.is_some() {
            poller = Some(StatusPoller::new(channel, log, &config));
        }
    }

    let actions = build_actions(&config, upload_action)?;
    let mut orchestrator = PassOrchestrator::new(config, actions)?;
    tracing::info!(
        input = %orchestrator.config().input_dir.display(),
        output = %orchestrator.config().output_dir.display(),
        ledger_rows = orchestrator.ledger().len(),
        "fastq handler started"
    );

    if cli.once {
        let report = orchestrator.run_pass()?;
        if let Some(poller) = &poller {
            poller.poll_once()?;
        }
        if let Some(path) = &cli.status_json {
            write_status_json(path, &report)?;
        }
        return Ok(());
    }

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    spawn_ctrl_c(stop_tx)?;

    let result = match poller {
        Some(poller) => {
            let token = Arc::new(HandoffToken::new(MERGE_WORKER));
            let poll_interval = Duration::from_secs(cli.poll_interval);
            let poll_stop = stop_rx.clone();
            let poll_token = token.clone();
            let handle = thread::Builder::new().name("status-poller".to_string()).spawn(move || {
                poller.run(&poll_stop, poll_interval, Some((poll_token.as_ref(), POLL_WORKER, MERGE_WORKER)))
            })?;

            let result = orchestrator.run_until_stopped(&stop_rx, Some((token.as_ref(), MERGE_WORKER, POLL_WORKER)));
            // A failed merge loop never signals the poller, so only join after a clean stop.
            if result.is_ok() && handle.join().is_err() {
                tracing::warn!("status poller panicked");
            }
            result
        }
        None => orchestrator.run_until_stopped(&stop_rx, None),
    };

    if let (Some(path), Some(report)) = (&cli.status_json, orchestrator.last_report()) {
        write_status_json(path, report)?;
    }
    result.map(|_| ())
}

fn main() -> ExitCode {
    dotenv().ok();
    fastq_handler::init_tracing("fastq_handler");
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fastq_handler: {}", e);
            ExitCode::FAILURE
        }
    }
}
