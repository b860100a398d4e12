//! Resolved configuration types shared across crates.
//!
//! These types represent fully-validated configuration state. Raw
//! deserialization structs stay private to this module; the public types are
//! produced through `#[serde(try_from)]` so that a value existing at all is the
//! proof that it passed validation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// How long the client waits for the worker to answer `initialize`.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// How long `stop()` waits for each shutdown phase before escalating.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Watched-file glob used when the configuration does not name one.
pub const DEFAULT_WATCH_PATTERN: &str = "**/config.json";

/// `clientInfo.name` sent during the handshake unless overridden.
pub const DEFAULT_CLIENT_NAME: &str = "conduit";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("worker command must not be empty")]
    EmptyCommand,
    #[error("invalid glob `{pattern}`: {message}")]
    InvalidGlob { pattern: String, message: String },
    #[error("document filter must set at least one of scheme, language or pattern")]
    EmptyFilter,
    #[error("handshake timeout must be greater than zero")]
    ZeroHandshakeTimeout,
}

fn check_glob(pattern: &str) -> Result<(), SettingsError> {
    globset::Glob::new(pattern)
        .map(|_| ())
        .map_err(|e| SettingsError::InvalidGlob {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

/// Verbosity of the message trace written to the log.
///
/// Purely diagnostic: changing it never sends anything to the worker.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    #[default]
    Off,
    /// Method names and ids only.
    Messages,
    /// Full message payloads.
    Verbose,
}

impl TraceLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Messages => "messages",
            Self::Verbose => "verbose",
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Messages => 1,
            Self::Verbose => 2,
        }
    }

    /// Inverse of [`TraceLevel::as_u8`]; unknown values clamp to `Verbose`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Off,
            1 => Self::Messages,
            _ => Self::Verbose,
        }
    }
}

#[derive(Deserialize)]
struct RawWorkerConfig {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    use_shell: bool,
    #[serde(default)]
    detach_from_parent: bool,
}

/// Validated worker launch configuration.
///
/// Invariant: `command` is non-empty.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawWorkerConfig")]
pub struct WorkerConfig {
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    use_shell: bool,
    detach_from_parent: bool,
}

impl TryFrom<RawWorkerConfig> for WorkerConfig {
    type Error = SettingsError;

    fn try_from(raw: RawWorkerConfig) -> Result<Self, Self::Error> {
        if raw.command.trim().is_empty() {
            return Err(SettingsError::EmptyCommand);
        }
        Ok(Self {
            command: raw.command,
            args: raw.args,
            cwd: raw.cwd,
            env: raw.env,
            use_shell: raw.use_shell,
            detach_from_parent: raw.detach_from_parent,
        })
    }
}

impl WorkerConfig {
    pub fn new(command: impl Into<String>) -> Result<Self, SettingsError> {
        Self::try_from(RawWorkerConfig {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            use_shell: false,
            detach_from_parent: false,
        })
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_shell(mut self, use_shell: bool) -> Self {
        self.use_shell = use_shell;
        self
    }

    pub fn with_detach_from_parent(mut self, detach: bool) -> Self {
        self.detach_from_parent = detach;
        self
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Extra environment variables layered over the parent's environment.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    #[must_use]
    pub fn use_shell(&self) -> bool {
        self.use_shell
    }

    /// Whether the worker gets its own process group, so terminal signals
    /// aimed at the host do not reach it.
    #[must_use]
    pub fn detach_from_parent(&self) -> bool {
        self.detach_from_parent
    }
}

/// Byte channel used to reach the worker.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TransportConfig {
    /// The worker's stdin/stdout pipe pair.
    #[default]
    Stdio,
    /// The client listens on `127.0.0.1:port` (0 picks a free port) and the
    /// worker is launched with `--socket=<port>` to connect back.
    Socket {
        #[serde(default)]
        port: u16,
    },
}

#[derive(Deserialize)]
struct RawDocumentFilterConfig {
    #[serde(default)]
    scheme: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
}

/// One entry of a document selector.
///
/// Invariant: at least one field is set and `pattern` is a valid glob.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawDocumentFilterConfig")]
pub struct DocumentFilterConfig {
    scheme: Option<String>,
    language: Option<String>,
    pattern: Option<String>,
}

impl TryFrom<RawDocumentFilterConfig> for DocumentFilterConfig {
    type Error = SettingsError;

    fn try_from(raw: RawDocumentFilterConfig) -> Result<Self, Self::Error> {
        if raw.scheme.is_none() && raw.language.is_none() && raw.pattern.is_none() {
            return Err(SettingsError::EmptyFilter);
        }
        if let Some(pattern) = &raw.pattern {
            check_glob(pattern)?;
        }
        Ok(Self {
            scheme: raw.scheme,
            language: raw.language,
            pattern: raw.pattern,
        })
    }
}

impl DocumentFilterConfig {
    pub fn new(
        scheme: Option<&str>,
        language: Option<&str>,
        pattern: Option<&str>,
    ) -> Result<Self, SettingsError> {
        Self::try_from(RawDocumentFilterConfig {
            scheme: scheme.map(str::to_string),
            language: language.map(str::to_string),
            pattern: pattern.map(str::to_string),
        })
    }

    /// Filter admitting every local file.
    #[must_use]
    pub fn local_files() -> Self {
        Self {
            scheme: Some("file".to_string()),
            language: None,
            pattern: None,
        }
    }

    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    #[must_use]
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }
}

fn default_selector() -> Vec<DocumentFilterConfig> {
    vec![DocumentFilterConfig::local_files()]
}

fn default_watch_pattern() -> String {
    DEFAULT_WATCH_PATTERN.to_string()
}

const fn default_handshake_timeout_secs() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

const fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

#[derive(Deserialize)]
struct RawClientConfig {
    worker: WorkerConfig,
    #[serde(default)]
    transport: TransportConfig,
    #[serde(default = "default_selector")]
    document_selector: Vec<DocumentFilterConfig>,
    #[serde(default = "default_watch_pattern")]
    watch_pattern: String,
    #[serde(default)]
    watch_root: Option<PathBuf>,
    #[serde(default)]
    root: Option<PathBuf>,
    #[serde(default = "default_handshake_timeout_secs")]
    handshake_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    shutdown_grace_ms: u64,
    #[serde(default)]
    trace: TraceLevel,
    #[serde(default)]
    initialization_options: Option<serde_json::Value>,
    #[serde(default)]
    client_name: Option<String>,
}

/// Complete configuration of one client session.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawClientConfig")]
pub struct ClientConfig {
    worker: WorkerConfig,
    transport: TransportConfig,
    document_selector: Vec<DocumentFilterConfig>,
    watch_pattern: String,
    watch_root: Option<PathBuf>,
    root: Option<PathBuf>,
    handshake_timeout: Duration,
    shutdown_grace: Duration,
    trace: TraceLevel,
    initialization_options: Option<serde_json::Value>,
    client_name: String,
}

impl TryFrom<RawClientConfig> for ClientConfig {
    type Error = SettingsError;

    fn try_from(raw: RawClientConfig) -> Result<Self, Self::Error> {
        check_glob(&raw.watch_pattern)?;
        if raw.handshake_timeout_secs == 0 {
            return Err(SettingsError::ZeroHandshakeTimeout);
        }
        Ok(Self {
            worker: raw.worker,
            transport: raw.transport,
            document_selector: raw.document_selector,
            watch_pattern: raw.watch_pattern,
            watch_root: raw.watch_root,
            root: raw.root,
            handshake_timeout: Duration::from_secs(raw.handshake_timeout_secs),
            shutdown_grace: Duration::from_millis(raw.shutdown_grace_ms),
            trace: raw.trace,
            initialization_options: raw.initialization_options,
            client_name: raw
                .client_name
                .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string()),
        })
    }
}

impl ClientConfig {
    /// Configuration with every optional setting at its default.
    #[must_use]
    pub fn new(worker: WorkerConfig) -> Self {
        Self {
            worker,
            transport: TransportConfig::default(),
            document_selector: default_selector(),
            watch_pattern: default_watch_pattern(),
            watch_root: None,
            root: None,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            trace: TraceLevel::default(),
            initialization_options: None,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_document_selector(mut self, filters: Vec<DocumentFilterConfig>) -> Self {
        self.document_selector = filters;
        self
    }

    pub fn with_watch_pattern(mut self, pattern: impl Into<String>) -> Result<Self, SettingsError> {
        let pattern = pattern.into();
        check_glob(&pattern)?;
        self.watch_pattern = pattern;
        Ok(self)
    }

    pub fn with_watch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.watch_root = Some(root.into());
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Result<Self, SettingsError> {
        if timeout.is_zero() {
            return Err(SettingsError::ZeroHandshakeTimeout);
        }
        self.handshake_timeout = timeout;
        Ok(self)
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_trace(mut self, trace: TraceLevel) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_initialization_options(mut self, options: serde_json::Value) -> Self {
        self.initialization_options = Some(options);
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    #[must_use]
    pub fn worker(&self) -> &WorkerConfig {
        &self.worker
    }

    #[must_use]
    pub fn transport(&self) -> TransportConfig {
        self.transport
    }

    #[must_use]
    pub fn document_selector(&self) -> &[DocumentFilterConfig] {
        &self.document_selector
    }

    #[must_use]
    pub fn watch_pattern(&self) -> &str {
        &self.watch_pattern
    }

    /// Directory observed for watched-file events, if any.
    #[must_use]
    pub fn watch_root(&self) -> Option<&Path> {
        self.watch_root.as_deref()
    }

    /// Workspace root announced to the worker during the handshake.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    #[must_use]
    pub fn trace(&self) -> TraceLevel {
        self.trace
    }

    #[must_use]
    pub fn initialization_options(&self) -> Option<&serde_json::Value> {
        self.initialization_options.as_ref()
    }

    #[must_use]
    pub fn client_name(&self) -> &str {
        &self.client_name
    }
}
