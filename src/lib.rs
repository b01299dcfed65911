pub mod actions;
pub mod config;
pub mod depth;
pub mod error;
pub mod handoff;
pub mod ledger;
pub mod metadata;
pub mod open_probe;
pub mod orchestrator;
pub mod processor;
pub mod remote;
pub mod run_info;
pub mod seq_files;

pub use error::*;

use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
    if installed.is_ok() {
        tracing::debug!(service, "tracing initialised");
    }
}
