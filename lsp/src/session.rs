//! Session owner task.
//!
//! One task owns every piece of mutable session state: the protocol state
//! machine, the pending request table, the pre-activation queue, the
//! document synchronizer, the watch buffer and the notification handlers.
//! The facade talks to it only through [`Command`]s; the reader task feeds
//! it decoded messages; the supervisor reports worker exit through a
//! oneshot.
//!
//! ```text
//! Uninitialized -> Initializing -> Active -> ShuttingDown -> Stopped
//!                        |            |
//!                        +------------+-----> Crashed
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::capabilities::{Capabilities, ClientCapabilities, ServerCapabilities};
use crate::error::{ClientError, HandshakeError};
use crate::message::{Message, Notification, Request, RequestId, Response, ResponseError};
use crate::process::{WorkerHandle, WorkerState};
use crate::protocol::{
    self, Cancel, CancelParams, Exit, Initialize, InitializeResult, Initialized,
    InitializedParams, LogMessageParams, MessageType, NotificationKind, RequestKind, Shutdown,
};
use crate::sync::{DocumentEvent, DocumentSync};
use crate::trace::MessageTrace;
use crate::transport::{self, ByteChannel, ChannelError, Inbound, WriterCommand};
use crate::watch::{FileEvent, WatchBridge};

/// Protocol lifecycle of one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Active,
    ShuttingDown,
    Stopped,
    Crashed,
}

impl SessionState {
    /// `Stopped` and `Crashed` are final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub(crate) type NotificationHandler = Box<dyn FnMut(&Value) + Send>;
pub(crate) type RequestReply = oneshot::Sender<Result<Value, ClientError>>;

pub(crate) enum Command {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
        reply: RequestReply,
    },
    Cancel {
        id: RequestId,
    },
    Notify(Notification),
    Subscribe {
        method: String,
        handler: NotificationHandler,
    },
    Document(DocumentEvent),
    File(FileEvent),
    /// Begin the shutdown/exit exchange. `reply` is answered (or dropped)
    /// once the worker acknowledged or the session ended.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    /// End the session now.
    Abort,
}

/// Monotonic id source shared by the facade and the owner task.
#[derive(Debug, Clone)]
pub(crate) struct RequestIds(Arc<AtomicI64>);

impl RequestIds {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(1)))
    }

    pub fn next(&self) -> RequestId {
        RequestId::Number(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

enum Pending {
    Caller(RequestReply),
    Handshake,
    Shutdown,
}

struct QueuedRequest {
    id: RequestId,
    method: String,
    params: Option<Value>,
    reply: RequestReply,
}

struct Handshake {
    deadline: Instant,
    timeout: Duration,
    ready: oneshot::Sender<Result<Capabilities, ClientError>>,
}

/// Everything the owner task needs, assembled by the facade.
pub(crate) struct SessionSetup {
    pub channel: ByteChannel,
    pub worker: Option<WorkerHandle>,
    /// `None` when there is no supervised process (an externally supplied
    /// channel); end of stream then stands in for the exit.
    pub exit: Option<oneshot::Receiver<WorkerState>>,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub state_tx: watch::Sender<SessionState>,
    pub ids: RequestIds,
    pub documents: DocumentSync,
    pub watch: WatchBridge,
    pub client_caps: ClientCapabilities,
    pub initialize_params: Value,
    pub handshake_timeout: Duration,
    pub trace: MessageTrace,
}

pub(crate) type ReadySignal = oneshot::Receiver<Result<Capabilities, ClientError>>;

struct Session {
    state_tx: watch::Sender<SessionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    inbound_open: bool,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
    worker: Option<WorkerHandle>,
    exit: Option<oneshot::Receiver<WorkerState>>,
    supervised: bool,
    ids: RequestIds,
    pending: HashMap<RequestId, Pending>,
    queued: VecDeque<QueuedRequest>,
    handlers: HashMap<String, Vec<NotificationHandler>>,
    documents: DocumentSync,
    watch: WatchBridge,
    client_caps: ClientCapabilities,
    capabilities: Option<Capabilities>,
    handshake: Option<Handshake>,
    shutdown_ack: Option<oneshot::Sender<()>>,
    done: bool,
}

/// Start the owner task and send `initialize`.
pub(crate) fn spawn(setup: SessionSetup) -> (JoinHandle<()>, ReadySignal) {
    let tasks = transport::spawn(setup.channel, setup.trace);
    let (ready_tx, ready_rx) = oneshot::channel();
    let supervised = setup.exit.is_some();

    let session = Session {
        state_tx: setup.state_tx,
        commands: setup.commands,
        writer_tx: tasks.writer_tx,
        inbound: tasks.inbound_rx,
        inbound_open: true,
        reader_handle: tasks.reader_handle,
        writer_handle: tasks.writer_handle,
        worker: setup.worker,
        exit: setup.exit,
        supervised,
        ids: setup.ids,
        pending: HashMap::new(),
        queued: VecDeque::new(),
        handlers: HashMap::new(),
        documents: setup.documents,
        watch: setup.watch,
        client_caps: setup.client_caps,
        capabilities: None,
        handshake: Some(Handshake {
            deadline: Instant::now() + setup.handshake_timeout,
            timeout: setup.handshake_timeout,
            ready: ready_tx,
        }),
        shutdown_ack: None,
        done: false,
    };
    let handle = tokio::spawn(session.run(setup.initialize_params));
    (handle, ready_rx)
}

/// Resolves when the worker exit fires, clearing the slot. Pending forever
/// when there is nothing to wait for.
async fn next_exit(slot: &mut Option<oneshot::Receiver<WorkerState>>) -> WorkerState {
    let state = match slot.as_mut() {
        Some(rx) => rx.await.unwrap_or(WorkerState::Exited(None)),
        None => std::future::pending().await,
    };
    *slot = None;
    state
}

impl Session {
    async fn run(mut self, initialize_params: Value) {
        self.set_state(SessionState::Initializing);
        let id = self.ids.next();
        self.pending.insert(id.clone(), Pending::Handshake);
        self.write(Message::Request(Request {
            id,
            method: Initialize::METHOD.to_string(),
            params: Some(initialize_params),
        }));

        while !self.done {
            self.step().await;
        }

        self.reader_handle.abort();
        // Give the writer a moment to flush what is already queued.
        if tokio::time::timeout(WRITER_DRAIN, &mut self.writer_handle)
            .await
            .is_err()
        {
            tracing::debug!("Writer still blocked; abandoning it");
            self.writer_handle.abort();
        }
        tracing::debug!("Session owner finished in state {}", self.state());
    }

    async fn step(&mut self) {
        let deadline = self.handshake.as_ref().map(|h| h.deadline);
        let exit_armed = self.exit.is_some();
        let inbound_open = self.inbound_open;

        tokio::select! {
            biased;

            inbound = self.inbound.recv(), if inbound_open => match inbound {
                Some(Inbound::Message(message)) => self.on_message(message),
                Some(Inbound::Closed(err)) => self.on_channel_closed(err),
                None => self.on_channel_closed(None),
            },
            state = next_exit(&mut self.exit), if exit_armed => self.on_worker_exit(state),
            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(handshake) = self.handshake.take() {
                    let timeout = handshake.timeout;
                    self.fail_handshake(handshake, HandshakeError::Timeout(timeout));
                }
            }
            command = self.commands.recv() => match command {
                Some(command) => self.on_command(command),
                None => {
                    tracing::debug!("Client handle dropped; ending session");
                    self.finish(SessionState::Stopped);
                }
            },
        }
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!("Session {previous} -> {state}");
        }
    }

    fn active_capabilities(&self) -> Option<Capabilities> {
        if self.state() == SessionState::Active {
            self.capabilities
        } else {
            None
        }
    }

    /// Hand a message to the writer task. A closed writer means the channel
    /// is unusable.
    fn write(&mut self, message: Message) {
        if self.writer_tx.send(WriterCommand::Send(message)).is_err() {
            tracing::warn!("Worker channel writer is gone");
            self.on_channel_closed(Some(ChannelError::PeerClosed));
        }
    }

    fn notify<N: NotificationKind>(&mut self, params: &N::Params) {
        match protocol::notification::<N>(params) {
            Ok(note) => self.write(Message::Notification(note)),
            Err(e) => tracing::warn!("Failed to serialize {}: {e}", N::METHOD),
        }
    }

    fn write_all(&mut self, notes: impl IntoIterator<Item = Notification>) {
        for note in notes {
            self.write(Message::Notification(note));
        }
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::Response(response) => self.on_response(response),
            Message::Notification(note) => self.on_notification(note),
            Message::Request(request) => {
                let response = protocol::reply_to_worker_request(&request);
                if let Err(e) = &response.outcome {
                    tracing::debug!("Worker request '{}' unsupported: {e}", request.method);
                }
                self.write(Message::Response(response));
            }
        }
    }

    fn on_response(&mut self, response: Response) {
        let Response { id, outcome } = response;
        let Some(id) = id else {
            match outcome {
                Err(e) => tracing::warn!("Worker reported an error without request id: {e}"),
                Ok(_) => tracing::warn!("Discarding response without request id"),
            }
            return;
        };
        match self.pending.remove(&id) {
            None => tracing::warn!("Discarding response for unknown request {id}"),
            Some(Pending::Caller(reply)) => {
                let _ = reply.send(outcome.map_err(ClientError::Request));
            }
            Some(Pending::Handshake) => self.complete_handshake(outcome),
            Some(Pending::Shutdown) => self.on_shutdown_ack(outcome),
        }
    }

    fn on_notification(&mut self, note: Notification) {
        let Notification { method, params } = note;
        let params = params.unwrap_or(Value::Null);

        let is_message = matches!(method.as_str(), "window/logMessage" | "window/showMessage");
        if is_message {
            log_worker_message(&params);
        }

        match self.handlers.get_mut(&method) {
            Some(handlers) => {
                for handler in handlers.iter_mut() {
                    handler(&params);
                }
            }
            None if !is_message => {
                tracing::debug!("No handler for notification '{method}'");
            }
            None => {}
        }
    }

    fn on_command(&mut self, command: Command) {
        let state = self.state();
        match command {
            Command::Request {
                id,
                method,
                params,
                reply,
            } => {
                let request = QueuedRequest {
                    id,
                    method,
                    params,
                    reply,
                };
                match state {
                    SessionState::Uninitialized | SessionState::Initializing => {
                        self.queued.push_back(request);
                    }
                    SessionState::Active => self.dispatch(request),
                    other => {
                        let _ = request.reply.send(Err(ClientError::SessionNotActive(other)));
                    }
                }
            }
            Command::Cancel { id } => self.cancel(id),
            Command::Notify(note) => {
                if state == SessionState::Active {
                    self.write(Message::Notification(note));
                } else {
                    tracing::debug!("Dropping '{}' notification; session is {state}", note.method);
                }
            }
            Command::Subscribe { method, handler } => {
                self.handlers.entry(method).or_default().push(handler);
            }
            Command::Document(event) => {
                let caps = self.active_capabilities();
                let notes = self.documents.apply(event, caps.as_ref());
                self.write_all(notes);
            }
            Command::File(event) => {
                if matches!(state, SessionState::ShuttingDown) {
                    return;
                }
                let active = state == SessionState::Active;
                if let Some(note) = self.watch.observe(&event, active) {
                    self.write(Message::Notification(note));
                }
            }
            Command::Shutdown { reply } => self.begin_shutdown(reply),
            Command::Abort => {
                tracing::debug!("Session aborted in state {state}");
                self.finish(SessionState::Stopped);
            }
        }
    }

    fn dispatch(&mut self, request: QueuedRequest) {
        let QueuedRequest {
            id,
            method,
            params,
            reply,
        } = request;
        // Registered before the frame is handed off so the response always
        // finds its entry.
        self.pending.insert(id.clone(), Pending::Caller(reply));
        self.write(Message::Request(Request { id, method, params }));
    }

    fn cancel(&mut self, id: RequestId) {
        match self.pending.remove(&id) {
            Some(Pending::Caller(reply)) => {
                tracing::debug!("Cancelling request {id}");
                let _ = reply.send(Err(ClientError::Cancelled));
                if self.state() == SessionState::Active {
                    self.notify::<Cancel>(&CancelParams { id });
                }
            }
            Some(other) => {
                self.pending.insert(id, other);
            }
            None => {
                if let Some(index) = self.queued.iter().position(|queued| queued.id == id)
                    && let Some(queued) = self.queued.remove(index)
                {
                    let _ = queued.reply.send(Err(ClientError::Cancelled));
                }
            }
        }
    }

    fn complete_handshake(&mut self, outcome: Result<Value, ResponseError>) {
        let Some(handshake) = self.handshake.take() else {
            return;
        };
        let result = outcome.map_err(HandshakeError::Rejected).and_then(|value| {
            let result: InitializeResult = serde_json::from_value(value)
                .map_err(|e| HandshakeError::MalformedResult(e.to_string()))?;
            let server = ServerCapabilities::from_value(&result.capabilities).ok_or_else(|| {
                HandshakeError::MalformedResult("capabilities is not an object".to_string())
            })?;
            Ok((result, server))
        });

        let (result, server) = match result {
            Ok(parts) => parts,
            Err(e) => {
                self.fail_handshake(handshake, e);
                return;
            }
        };

        let caps = Capabilities::negotiate(&self.client_caps, &server);
        match &result.server_info {
            Some(info) => tracing::info!(
                "Worker '{}' {} ready",
                info.name,
                info.version.as_deref().unwrap_or("")
            ),
            None => tracing::info!("Worker ready"),
        }
        tracing::debug!("Negotiated capabilities: {caps:?}");
        self.capabilities = Some(caps);
        self.set_state(SessionState::Active);

        self.notify::<Initialized>(&InitializedParams {});
        let opens = self.documents.activate(&caps);
        self.write_all(opens);
        if let Some(note) = self.watch.flush() {
            self.write(Message::Notification(note));
        }
        while let Some(request) = self.queued.pop_front() {
            self.dispatch(request);
        }

        let _ = handshake.ready.send(Ok(caps));
    }

    fn fail_handshake(&mut self, handshake: Handshake, error: HandshakeError) {
        tracing::warn!("Handshake failed: {error}");
        let _ = handshake
            .ready
            .send(Err(ClientError::HandshakeFailure(error)));
        self.finish(SessionState::Crashed);
    }

    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        match self.state() {
            SessionState::Active => {
                self.set_state(SessionState::ShuttingDown);
                let id = self.ids.next();
                self.pending.insert(id.clone(), Pending::Shutdown);
                self.shutdown_ack = Some(reply);
                match protocol::encode_params(&()) {
                    Ok(params) => self.write(Message::Request(Request {
                        id,
                        method: Shutdown::METHOD.to_string(),
                        params,
                    })),
                    Err(e) => tracing::warn!("Failed to serialize shutdown: {e}"),
                }
            }
            SessionState::Uninitialized | SessionState::Initializing => {
                self.finish(SessionState::Stopped);
            }
            // Already shutting down or over; dropping `reply` releases the caller.
            SessionState::ShuttingDown | SessionState::Stopped | SessionState::Crashed => {}
        }
    }

    fn on_shutdown_ack(&mut self, outcome: Result<Value, ResponseError>) {
        if let Err(e) = outcome {
            tracing::warn!("Worker answered shutdown with an error: {e}");
        }
        self.notify::<Exit>(&());
        let _ = self.writer_tx.send(WriterCommand::Shutdown);
        if let Some(ack) = self.shutdown_ack.take() {
            let _ = ack.send(());
        }
        if !self.supervised {
            self.finish(SessionState::Stopped);
        }
    }

    fn on_worker_exit(&mut self, worker: WorkerState) {
        match self.state() {
            SessionState::Initializing => {
                if let Some(handshake) = self.handshake.take() {
                    self.fail_handshake(handshake, HandshakeError::WorkerExited(worker));
                }
            }
            SessionState::ShuttingDown => {
                tracing::info!("Worker {worker} after shutdown");
                self.finish(SessionState::Stopped);
            }
            SessionState::Active => {
                tracing::warn!("Worker {worker} unexpectedly");
                self.finish(SessionState::Crashed);
            }
            SessionState::Uninitialized | SessionState::Stopped | SessionState::Crashed => {}
        }
    }

    fn on_channel_closed(&mut self, error: Option<ChannelError>) {
        if !self.inbound_open && error.is_none() {
            return;
        }
        self.inbound_open = false;
        match self.state() {
            SessionState::Initializing => {
                if let Some(handshake) = self.handshake.take() {
                    self.fail_handshake(handshake, HandshakeError::ChannelClosed);
                }
            }
            SessionState::Active => {
                match &error {
                    Some(e) => tracing::warn!("Worker channel failed: {e}"),
                    None => tracing::warn!("Worker closed the channel"),
                }
                self.finish(SessionState::Crashed);
            }
            SessionState::ShuttingDown if !self.supervised => {
                self.finish(SessionState::Stopped);
            }
            _ => {}
        }
    }

    /// Enter a terminal state: fail everything outstanding, close the
    /// writer and make sure the worker goes away.
    fn finish(&mut self, final_state: SessionState) {
        if self.state().is_terminal() {
            self.done = true;
            return;
        }
        if let Some(handshake) = self.handshake.take() {
            let _ = handshake.ready.send(Err(ClientError::SessionTerminated));
        }
        self.set_state(final_state);

        for (_, pending) in self.pending.drain() {
            if let Pending::Caller(reply) = pending {
                let _ = reply.send(Err(ClientError::SessionTerminated));
            }
        }
        for queued in self.queued.drain(..) {
            let _ = queued.reply.send(Err(ClientError::SessionTerminated));
        }
        self.shutdown_ack = None;

        let _ = self.writer_tx.send(WriterCommand::Shutdown);
        if let Some(worker) = &self.worker
            && !worker.state().has_exited()
        {
            worker.kill();
        }
        self.done = true;
    }
}

fn log_worker_message(params: &Value) {
    let Ok(message) = serde_json::from_value::<LogMessageParams>(params.clone()) else {
        tracing::debug!("Malformed worker log message: {params}");
        return;
    };
    let text = message.message.as_str();
    match message.message_type() {
        Some(MessageType::Error) => tracing::error!(target: "conduit_lsp::worker", "{text}"),
        Some(MessageType::Warning) => tracing::warn!(target: "conduit_lsp::worker", "{text}"),
        Some(MessageType::Info) => tracing::info!(target: "conduit_lsp::worker", "{text}"),
        Some(MessageType::Log) | None => tracing::debug!(target: "conduit_lsp::worker", "{text}"),
    }
}
