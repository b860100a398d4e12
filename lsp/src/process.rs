//! Worker process supervision.
//!
//! [`launch`] resolves and spawns the worker, then hands the child to a
//! supervisor task that owns it until it exits. The exit is reported exactly
//! once through the `exit` receiver of [`LaunchedWorker`] and is also
//! observable through any clone of [`WorkerHandle`].

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use conduit_types::WorkerConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};

/// Lifecycle of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    /// Exited on its own. `None` when the exit code is unavailable
    /// (terminated by a signal).
    Exited(Option<i32>),
    /// Force-killed by the client.
    Killed,
}

impl WorkerState {
    #[must_use]
    pub fn has_exited(self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not started"),
            Self::Running => f.write_str("running"),
            Self::Exited(Some(code)) => write!(f, "exited with code {code}"),
            Self::Exited(None) => f.write_str("exited"),
            Self::Killed => f.write_str("killed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("worker executable `{command}` not found: {source}")]
    NotFound {
        command: String,
        #[source]
        source: which::Error,
    },
    #[error("permission denied launching `{command}`")]
    PermissionDenied {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("worker `{command}` has no {stream} pipe")]
    MissingPipe {
        command: String,
        stream: &'static str,
    },
    #[error("socket transport: {0}")]
    Socket(#[source] io::Error),
    #[error("worker did not connect within {0:?}")]
    AcceptTimeout(Duration),
    #[error("worker {0} before connecting")]
    ExitedBeforeConnect(WorkerState),
}

/// Shared view of a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    command: String,
    pid: Option<u32>,
    state: watch::Receiver<WorkerState>,
    kill_tx: mpsc::Sender<()>,
}

impl WorkerHandle {
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Ask the supervisor to kill the worker. Does not wait.
    pub fn kill(&self) {
        let _ = self.kill_tx.try_send(());
    }

    /// Wait until the worker has exited or been killed.
    pub async fn exited(&self) -> WorkerState {
        let mut rx = self.state.clone();
        let exited = rx.wait_for(|state| state.has_exited()).await.map(|state| *state);
        exited.unwrap_or_else(|_| *rx.borrow())
    }
}

/// A freshly spawned worker.
#[derive(Debug)]
pub struct LaunchedWorker {
    pub handle: WorkerHandle,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    /// Fires once with the final state.
    pub exit: oneshot::Receiver<WorkerState>,
}

/// Spawn the worker described by `config`, appending `extra_args`.
///
/// Must be called from within a tokio runtime.
pub fn launch(config: &WorkerConfig, extra_args: &[String]) -> Result<LaunchedWorker, LaunchError> {
    let command_name = config.command().to_string();
    let mut cmd = build_command(config, extra_args)?;

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = config.cwd() {
        cmd.current_dir(cwd);
    }
    cmd.envs(config.env());
    if config.detach_from_parent() {
        detach(&mut cmd);
    }

    let mut child = cmd.spawn().map_err(|source| {
        if source.kind() == io::ErrorKind::PermissionDenied {
            LaunchError::PermissionDenied {
                command: command_name.clone(),
                source,
            }
        } else {
            LaunchError::Spawn {
                command: command_name.clone(),
                source,
            }
        }
    })?;

    let pid = child.id();
    tracing::info!("Launched worker '{command_name}' (pid {pid:?})");

    let stdin = child.stdin.take().ok_or_else(|| LaunchError::MissingPipe {
        command: command_name.clone(),
        stream: "stdin",
    })?;
    let stdout = child.stdout.take().ok_or_else(|| LaunchError::MissingPipe {
        command: command_name.clone(),
        stream: "stdout",
    })?;
    if let Some(stderr) = child.stderr.take() {
        forward_output(stderr, command_name.clone(), "stderr");
    }

    let (state_tx, state_rx) = watch::channel(WorkerState::Running);
    let (kill_tx, kill_rx) = mpsc::channel(1);
    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(supervise(
        child,
        command_name.clone(),
        kill_rx,
        state_tx,
        exit_tx,
    ));

    Ok(LaunchedWorker {
        handle: WorkerHandle {
            command: command_name,
            pid,
            state: state_rx,
            kill_tx,
        },
        stdin,
        stdout,
        exit: exit_rx,
    })
}

/// Wait up to `grace` for the worker to exit, then force-kill it.
pub async fn terminate(handle: &WorkerHandle, grace: Duration) -> WorkerState {
    if let Ok(state) = tokio::time::timeout(grace, handle.exited()).await {
        return state;
    }
    tracing::warn!(
        "Worker '{}' did not exit within {grace:?}; killing it",
        handle.command
    );
    handle.kill();
    handle.exited().await
}

async fn supervise(
    mut child: Child,
    command: String,
    mut kill_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<WorkerState>,
    exit_tx: oneshot::Sender<WorkerState>,
) {
    let mut killed = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kill_rx.recv(), if !killed => {
                if request.is_none() {
                    tracing::debug!("All handles to worker '{command}' dropped; killing it");
                }
                killed = true;
                if let Err(e) = child.start_kill() {
                    tracing::warn!("Failed to kill worker '{command}': {e}");
                }
            }
        }
    };

    let final_state = match status {
        Ok(_) if killed => WorkerState::Killed,
        Ok(status) => WorkerState::Exited(status.code()),
        Err(e) => {
            tracing::warn!("Failed to wait on worker '{command}': {e}");
            WorkerState::Exited(None)
        }
    };
    tracing::info!("Worker '{command}' {final_state}");
    state_tx.send_replace(final_state);
    let _ = exit_tx.send(final_state);
}

/// Shell builtins and keywords; a line starting with one has no program to
/// look up.
const SHELL_BUILTINS: &[&str] = &[
    "!", ".", ":", "[", "{", "(", "case", "cd", "echo", "eval", "exec", "exit", "export",
    "false", "for", "if", "printf", "set", "source", "test", "true", "until", "while",
];

fn build_command(config: &WorkerConfig, extra_args: &[String]) -> Result<Command, LaunchError> {
    if config.use_shell() {
        if let Some(program) = shell_program(config.command()) {
            resolve(config, program)?;
        }
        let line = shell_line(
            config.command(),
            config.args().iter().chain(extra_args).map(String::as_str),
        );
        #[cfg(windows)]
        let cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(line);
            cmd
        };
        #[cfg(not(windows))]
        let cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            cmd
        };
        return Ok(cmd);
    }

    let resolved = resolve(config, config.command())?;
    let mut cmd = Command::new(resolved);
    cmd.args(config.args()).args(extra_args);
    Ok(cmd)
}

/// Find the executable on `PATH` (the configured one, if `env` overrides it),
/// relative to the configured working directory.
fn resolve(config: &WorkerConfig, command: &str) -> Result<PathBuf, LaunchError> {
    let search_path: Option<OsString> = config
        .env()
        .get("PATH")
        .map(OsString::from)
        .or_else(|| std::env::var_os("PATH"));
    let cwd = match config.cwd() {
        Some(cwd) => Some(cwd.to_path_buf()),
        None => std::env::current_dir().ok(),
    };
    let result = match cwd {
        Some(cwd) => which::which_in(command, search_path, cwd),
        None => which::which(command),
    };
    result.map_err(|source| LaunchError::NotFound {
        command: command.to_string(),
        source,
    })
}

/// The program a shell line runs, when it can be named without running the
/// shell: the first word, unless it is a builtin or uses shell syntax.
fn shell_program(line: &str) -> Option<&str> {
    let first = line.split_whitespace().next()?;
    let syntax = ['=', '$', '`', '\'', '"', '\\', '(', ')', ';', '|', '&', '<', '>', '*', '?', '~'];
    if SHELL_BUILTINS.contains(&first) || first.contains(&syntax[..]) {
        return None;
    }
    Some(first)
}

/// The command is passed verbatim so it may use shell syntax; arguments
/// are quoted.
fn shell_line<'a>(command: &str, args: impl Iterator<Item = &'a str>) -> String {
    let mut line = command.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&quote_arg(arg));
    }
    line
}

#[cfg(not(windows))]
fn quote_arg(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(windows)]
fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('"', "\\\""))
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_cmd: &mut Command) {}

/// Copy a worker output stream into the log, line by line.
pub(crate) fn forward_output<R>(reader: R, command: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    tracing::debug!(
                        target: "conduit_lsp::worker",
                        "{command} {stream}: {}",
                        line.trim_end()
                    );
                }
                Err(e) => {
                    tracing::debug!("Stopped reading worker {stream}: {e}");
                    break;
                }
            }
        }
    });
}
