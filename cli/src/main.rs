//! `conduit`: start a language worker, open files, print diagnostics.
//!
//! ```text
//! conduit [--config PATH] [--settle-ms N] FILE...
//! ```

mod config;

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use conduit_lsp::protocol::{self, PublishDiagnostics, PublishDiagnosticsParams};
use conduit_lsp::{LspClient, SessionState};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{ConduitConfig, config_path};

/// Quiet period after the last diagnostics before stopping.
const DEFAULT_SETTLE: Duration = Duration::from_millis(1500);

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Diagnostics go to stdout; keep logs on stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: <data dir>/conduit/logs/conduit.log
    if let Some(data_dir) = dirs::data_local_dir() {
        candidates.push(data_dir.join("conduit").join("logs").join("conduit.log"));
    }

    // Fallback: ~/.conduit/logs/conduit.log
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".conduit").join("logs").join("conduit.log"));
    }

    candidates
}

#[derive(Debug, Parser)]
#[command(name = "conduit")]
#[command(about = "Start a language worker, open files and print its diagnostics")]
struct Args {
    /// Config file (defaults to $CONDUIT_CONFIG or the user config dir)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Quiet period in milliseconds after the last diagnostics
    #[arg(long = "settle-ms", value_name = "N")]
    settle_ms: Option<u64>,
    /// Files to open
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,
}

impl Args {
    fn settle(&self) -> Duration {
        self.settle_ms.map_or(DEFAULT_SETTLE, Duration::from_millis)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();

    let path = args
        .config
        .clone()
        .or_else(config_path)
        .context("no config path: set CONDUIT_CONFIG or pass --config")?;
    let config = ConduitConfig::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;

    let mut client = LspClient::new(config.client.clone());
    let (diag_tx, mut diag_rx) = mpsc::unbounded_channel();
    client.on_notification::<PublishDiagnostics, _>(move |params| {
        let _ = diag_tx.send(params);
    })?;

    let caps = client
        .start()
        .await
        .with_context(|| format!("starting worker `{}`", config.client.worker().command()))?;
    tracing::info!("Session active: {caps:?}");

    for file in &args.files {
        let text = fs::read_to_string(file)
            .with_context(|| format!("reading {}", file.display()))?;
        let absolute = std::path::absolute(file)
            .with_context(|| format!("resolving {}", file.display()))?;
        let uri = protocol::path_to_file_uri(&absolute)?;
        client.did_open(uri, config.language_for(file), text)?;
    }

    let settle = args.settle();
    let mut latest: BTreeMap<String, PublishDiagnosticsParams> = BTreeMap::new();
    let mut states = client.subscribe_state();
    loop {
        tokio::select! {
            received = tokio::time::timeout(settle, diag_rx.recv()) => match received {
                Ok(Some(params)) => {
                    latest.insert(params.uri.clone(), params);
                }
                Ok(None) | Err(_) => break,
            },
            changed = states.wait_for(|state| state.is_terminal()) => {
                if let Ok(state) = changed {
                    tracing::warn!("Session ended early: {}", *state);
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    print_diagnostics(&latest);

    let crashed = client.state() == SessionState::Crashed;
    client.stop().await;
    if crashed {
        bail!("worker crashed");
    }
    Ok(())
}

fn print_diagnostics(latest: &BTreeMap<String, PublishDiagnosticsParams>) {
    for params in latest.values() {
        let path = protocol::file_uri_to_path(&params.uri)
            .unwrap_or_else(|| PathBuf::from(&params.uri));
        for diagnostic in &params.diagnostics {
            println!("{}", diagnostic.display_with_path(display_path(&path)));
        }
    }
}

fn display_path(path: &Path) -> &Path {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| path.strip_prefix(cwd).ok())
        .unwrap_or(path)
}
