//! Client facade.
//!
//! [`LspClient`] is what the host holds. It launches (or is handed) the
//! worker channel, starts the session owner task and forwards every host
//! call to it as a command. Nothing here mutates session state directly.

use std::path::PathBuf;
use std::time::Duration;

use conduit_types::{ClientConfig, TraceLevel, TransportConfig};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::capabilities::{Capabilities, ClientCapabilities};
use crate::error::ClientError;
use crate::message::RequestId;
use crate::process::{self, LaunchError, LaunchedWorker, WorkerHandle, WorkerState};
use crate::protocol::{self, InitializeArgs, NotificationKind, RequestKind};
use crate::selector::DocumentSelector;
use crate::session::{self, Command, RequestIds, SessionSetup, SessionState};
use crate::sync::{DocumentEvent, DocumentSync};
use crate::trace::MessageTrace;
use crate::transport::ByteChannel;
use crate::watch::{FileChangeKind, FileEvent, FileWatcher, WatchBridge};

/// Handle to one worker session.
///
/// Requests and notifications may be issued before [`LspClient::start`];
/// requests are queued until the handshake completes.
pub struct LspClient {
    config: ClientConfig,
    /// Caller-supplied channel for [`LspClient::connect`].
    channel: Option<ByteChannel>,
    commands_tx: mpsc::UnboundedSender<Command>,
    /// Handed to the owner task on start.
    commands_rx: Option<mpsc::UnboundedReceiver<Command>>,
    /// Held until the owner task takes over publishing state.
    state_tx: Option<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    ids: RequestIds,
    trace: MessageTrace,
    capabilities: Option<Capabilities>,
    worker: Option<WorkerHandle>,
    owner: Option<JoinHandle<()>>,
    watcher: Option<FileWatcher>,
}

impl LspClient {
    /// A client that launches the configured worker on [`start`](Self::start).
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Uninitialized);
        let trace = MessageTrace::new(config.trace());
        Self {
            config,
            channel: None,
            commands_tx,
            commands_rx: Some(commands_rx),
            state_tx: Some(state_tx),
            state_rx,
            ids: RequestIds::new(),
            trace,
            capabilities: None,
            worker: None,
            owner: None,
            watcher: None,
        }
    }

    /// A client over an already connected channel. No process is launched;
    /// the end of the stream stands in for worker exit.
    #[must_use]
    pub fn connect(config: ClientConfig, channel: ByteChannel) -> Self {
        let mut client = Self::new(config);
        client.channel = Some(channel);
        client
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Receiver observing every state transition.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Negotiated capabilities, once the handshake succeeded.
    #[must_use]
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities
    }

    #[must_use]
    pub fn worker(&self) -> Option<&WorkerHandle> {
        self.worker.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Change message tracing. Only affects logging.
    pub fn set_trace_level(&self, level: TraceLevel) {
        self.trace.set(level);
        tracing::debug!("Message trace set to {}", level.as_str());
    }

    /// Launch the worker, run the handshake and wait for it to complete.
    ///
    /// A launch failure leaves the client `Uninitialized`; a handshake
    /// failure leaves it `Crashed`.
    pub async fn start(&mut self) -> Result<Capabilities, ClientError> {
        let state = self.state();
        if state != SessionState::Uninitialized || self.commands_rx.is_none() {
            return Err(ClientError::SessionNotActive(state));
        }

        let documents = DocumentSync::new(DocumentSelector::from_config(
            self.config.document_selector(),
        ));
        let watch = WatchBridge::new(self.config.watch_pattern(), self.config.watch_root())?;

        let (channel, worker, exit) = match self.channel.take() {
            Some(channel) => (channel, None, None),
            None => {
                let (channel, handle, exit) = self.open_worker_channel().await?;
                (channel, Some(handle), Some(exit))
            }
        };

        let (Some(commands), Some(state_tx)) = (self.commands_rx.take(), self.state_tx.take())
        else {
            return Err(ClientError::SessionNotActive(state));
        };

        let client_caps = ClientCapabilities::default();
        let root_uri = self
            .config
            .root()
            .and_then(|root| match protocol::path_to_file_uri(root) {
                Ok(uri) => Some(uri),
                Err(e) => {
                    tracing::warn!("Ignoring workspace root: {e}");
                    None
                }
            });
        let initialize_params = protocol::initialize_params(InitializeArgs {
            root_uri: root_uri.as_ref(),
            client_name: self.config.client_name(),
            capabilities: &client_caps.to_json(),
            initialization_options: self.config.initialization_options(),
            trace: self.config.trace(),
        });

        self.worker.clone_from(&worker);
        let (owner, ready) = session::spawn(SessionSetup {
            channel,
            worker,
            exit,
            commands,
            state_tx,
            ids: self.ids.clone(),
            documents,
            watch,
            client_caps,
            initialize_params,
            handshake_timeout: self.config.handshake_timeout(),
            trace: self.trace.clone(),
        });
        self.owner = Some(owner);

        if let Some(root) = self.config.watch_root() {
            let commands = self.commands_tx.clone();
            match FileWatcher::start(root, move |event| {
                let _ = commands.send(Command::File(event));
            }) {
                Ok(watcher) => self.watcher = Some(watcher),
                Err(e) => tracing::warn!("File watching disabled for {}: {e}", root.display()),
            }
        }

        let caps = ready.await.unwrap_or(Err(ClientError::SessionTerminated))?;
        self.capabilities = Some(caps);
        Ok(caps)
    }

    async fn open_worker_channel(
        &self,
    ) -> Result<(ByteChannel, WorkerHandle, oneshot::Receiver<WorkerState>), ClientError> {
        let worker_config = self.config.worker();
        match self.config.transport() {
            TransportConfig::Stdio => {
                let LaunchedWorker {
                    handle,
                    stdin,
                    stdout,
                    exit,
                } = process::launch(worker_config, &[]).map_err(ClientError::LaunchFailure)?;
                Ok((ByteChannel::stdio(stdout, stdin), handle, exit))
            }
            TransportConfig::Socket { port } => {
                let socket_error = |e| ClientError::LaunchFailure(LaunchError::Socket(e));
                let listener = TcpListener::bind(("127.0.0.1", port))
                    .await
                    .map_err(socket_error)?;
                let port = listener.local_addr().map_err(socket_error)?.port();
                tracing::debug!("Listening for worker on 127.0.0.1:{port}");

                let LaunchedWorker {
                    handle,
                    stdin,
                    stdout,
                    mut exit,
                } = process::launch(worker_config, &[format!("--socket={port}")])
                    .map_err(ClientError::LaunchFailure)?;
                // The protocol runs over the socket; stdout is only logged.
                drop(stdin);
                process::forward_output(stdout, handle.command().to_string(), "stdout");

                let timeout = self.config.handshake_timeout();
                let accepted = tokio::select! {
                    accepted = tokio::time::timeout(timeout, listener.accept()) => accepted,
                    state = &mut exit => {
                        let state = state.unwrap_or(WorkerState::Exited(None));
                        return Err(ClientError::LaunchFailure(LaunchError::ExitedBeforeConnect(state)));
                    }
                };
                match accepted {
                    Ok(Ok((stream, peer))) => {
                        tracing::debug!("Worker connected from {peer}");
                        Ok((ByteChannel::tcp(stream), handle, exit))
                    }
                    Ok(Err(e)) => {
                        handle.kill();
                        Err(socket_error(e))
                    }
                    Err(_) => {
                        handle.kill();
                        Err(ClientError::LaunchFailure(LaunchError::AcceptTimeout(
                            timeout,
                        )))
                    }
                }
            }
        }
    }

    /// Shut the session down: `shutdown`, `exit`, then wait for the worker
    /// to exit, killing it once the configured grace period has elapsed.
    ///
    /// Safe to call repeatedly. On a session that was never started, queued
    /// requests fail with [`ClientError::SessionTerminated`].
    pub async fn stop(&mut self) {
        let state = self.state();
        if state.is_terminal() {
            return;
        }
        self.watcher = None;

        if let Some(state_tx) = &self.state_tx {
            state_tx.send_replace(SessionState::Stopped);
            if let Some(mut commands) = self.commands_rx.take() {
                commands.close();
                while let Ok(command) = commands.try_recv() {
                    if let Command::Request { reply, .. } = command {
                        let _ = reply.send(Err(ClientError::SessionTerminated));
                    }
                }
            }
            tracing::info!("Session {state} -> stopped");
            return;
        }

        // One grace period covers both the acknowledgement and the exit.
        let grace = self.config.shutdown_grace();
        let deadline = Instant::now() + grace;
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .commands_tx
            .send(Command::Shutdown { reply: ack_tx })
            .is_ok()
            && tokio::time::timeout_at(deadline, ack_rx).await.is_err()
        {
            tracing::warn!("Worker did not acknowledge shutdown within {grace:?}");
        }

        if let Some(worker) = &self.worker {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let final_state = process::terminate(worker, remaining).await;
            tracing::debug!("Worker '{}' {final_state}", worker.command());
        }
        let _ = self.commands_tx.send(Command::Abort);
        if let Some(owner) = self.owner.take()
            && let Err(e) = owner.await
        {
            tracing::warn!("Session task failed: {e}");
        }
    }

    fn ensure_accepting(&self) -> Result<(), ClientError> {
        match self.state() {
            state @ (SessionState::ShuttingDown | SessionState::Stopped | SessionState::Crashed) => {
                Err(ClientError::SessionNotActive(state))
            }
            _ => Ok(()),
        }
    }

    fn push(&self, command: Command) -> Result<(), ClientError> {
        self.ensure_accepting()?;
        self.commands_tx
            .send(command)
            .map_err(|_| ClientError::SessionTerminated)
    }

    /// Issue a request and return a handle to its eventual response.
    pub fn begin_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<PendingRequest, ClientError> {
        let id = self.ids.next();
        let (reply, rx) = oneshot::channel();
        self.push(Command::Request {
            id: id.clone(),
            method: method.into(),
            params,
            reply,
        })?;
        Ok(PendingRequest {
            id,
            reply: rx,
            commands: self.commands_tx.clone(),
            settled: false,
            cancelled: false,
        })
    }

    /// Issue a request and wait for its response. Dropping the returned
    /// future cancels the request.
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        self.begin_request(method, params)?.wait().await
    }

    pub async fn send_request_with_timeout(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        self.begin_request(method, params)?
            .wait_timeout(timeout)
            .await
    }

    /// Typed request.
    ///
    /// ```ignore
    /// let hover = client
    ///     .request::<HoverRequest>(&TextDocumentPositionParams::new(uri, Position::new(3, 7)))
    ///     .await?;
    /// ```
    pub async fn request<R: RequestKind>(&self, params: &R::Params) -> Result<R::Result, ClientError> {
        let params = protocol::encode_params(params)?;
        let value = self.send_request(R::METHOD, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a notification. Notifications issued before the session is
    /// active are dropped.
    pub fn send_notification(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), ClientError> {
        self.push(Command::Notify(crate::message::Notification {
            method: method.into(),
            params,
        }))
    }

    pub fn notify<N: NotificationKind>(&self, params: &N::Params) -> Result<(), ClientError> {
        let note = protocol::notification::<N>(params)?;
        self.push(Command::Notify(note))
    }

    /// Register a handler for a worker notification. Handlers run on the
    /// session task, in arrival order; they must not block.
    pub fn on_raw_notification<F>(&self, method: impl Into<String>, handler: F) -> Result<(), ClientError>
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.commands_tx
            .send(Command::Subscribe {
                method: method.into(),
                handler: Box::new(handler),
            })
            .map_err(|_| ClientError::SessionTerminated)
    }

    /// Typed variant of [`on_raw_notification`](Self::on_raw_notification).
    /// Params that fail to deserialize are logged and skipped.
    pub fn on_notification<N, F>(&self, mut handler: F) -> Result<(), ClientError>
    where
        N: NotificationKind + 'static,
        F: FnMut(N::Params) + Send + 'static,
    {
        self.on_raw_notification(N::METHOD, move |params: &Value| {
            match serde_json::from_value::<N::Params>(params.clone()) {
                Ok(params) => handler(params),
                Err(e) => tracing::warn!("Malformed '{}' params: {e}", N::METHOD),
            }
        })
    }

    pub fn document_event(&self, event: DocumentEvent) -> Result<(), ClientError> {
        self.push(Command::Document(event))
    }

    pub fn did_open(
        &self,
        uri: Url,
        language_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.document_event(DocumentEvent::Opened {
            uri,
            language_id: language_id.into(),
            text: text.into(),
        })
    }

    /// `text` is the complete new content of the document.
    pub fn did_change(&self, uri: Url, text: impl Into<String>) -> Result<(), ClientError> {
        self.document_event(DocumentEvent::Changed {
            uri,
            text: text.into(),
        })
    }

    pub fn did_save(&self, uri: Url) -> Result<(), ClientError> {
        self.document_event(DocumentEvent::Saved { uri })
    }

    pub fn did_close(&self, uri: Url) -> Result<(), ClientError> {
        self.document_event(DocumentEvent::Closed { uri })
    }

    pub fn did_rename(&self, old_uri: Url, new_uri: Url) -> Result<(), ClientError> {
        self.document_event(DocumentEvent::Renamed { old_uri, new_uri })
    }

    /// Report a file-system change from a host-side watcher.
    pub fn file_changed(
        &self,
        path: impl Into<PathBuf>,
        kind: FileChangeKind,
    ) -> Result<(), ClientError> {
        self.push(Command::File(FileEvent::new(path, kind)))
    }
}

impl std::fmt::Debug for LspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspClient")
            .field("command", &self.config.worker().command())
            .field("state", &self.state())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// An outstanding request.
///
/// Dropping it before the response arrives cancels the request.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    reply: oneshot::Receiver<Result<Value, ClientError>>,
    commands: mpsc::UnboundedSender<Command>,
    settled: bool,
    cancelled: bool,
}

impl PendingRequest {
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response. Yields [`ClientError::Cancelled`] after
    /// [`cancel`](Self::cancel) unless the response won the race.
    pub async fn wait(mut self) -> Result<Value, ClientError> {
        let result = (&mut self.reply).await;
        self.settled = true;
        result.unwrap_or(Err(ClientError::SessionTerminated))
    }

    /// Like [`wait`](Self::wait), cancelling the request if no response
    /// arrives within `timeout`.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Value, ClientError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .unwrap_or(Err(ClientError::Timeout))
    }

    /// Withdraw the request and send `$/cancelRequest` if it is in flight.
    pub fn cancel(&mut self) {
        if self.cancelled || self.settled {
            return;
        }
        self.cancelled = true;
        let _ = self.commands.send(Command::Cancel {
            id: self.id.clone(),
        });
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.cancel();
    }
}
