//! Byte channels and the reader/writer tasks that sit on them.
//!
//! A [`ByteChannel`] is any pair of async byte streams: the worker's stdio
//! pipes, a TCP connection, or an in-memory duplex in tests. [`spawn`] splits
//! it into a writer task fed by [`WriterCommand`]s and a reader task that
//! decodes frames and forwards them to the session owner.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::message::{self, Message};
use crate::trace::MessageTrace;

/// Errors raised while moving frames over a channel.
///
/// [`ChannelError::PeerClosed`] means the other side went away; every other
/// variant is a fault that leaves the stream unusable.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("peer closed the channel")]
    PeerClosed,
    #[error("channel I/O error: {0}")]
    Io(#[source] io::Error),
    #[error("malformed frame header: {0}")]
    Header(String),
    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
}

impl ChannelError {
    /// Classify an error from the read half. EOF inside a frame is a close.
    pub(crate) fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::PeerClosed
        } else {
            Self::Io(err)
        }
    }

    #[must_use]
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }

    #[must_use]
    pub fn is_fault(&self) -> bool {
        !self.is_peer_closed()
    }
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => Self::PeerClosed,
            _ => Self::Io(err),
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A bidirectional byte stream to the worker.
pub struct ByteChannel {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl ByteChannel {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// The worker's stdout (we read) and stdin (we write).
    #[must_use]
    pub fn stdio(stdout: ChildStdout, stdin: ChildStdin) -> Self {
        Self::new(stdout, stdin)
    }

    #[must_use]
    pub fn tcp(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self::new(read, write)
    }
}

impl std::fmt::Debug for ByteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteChannel").finish_non_exhaustive()
    }
}

pub(crate) enum WriterCommand {
    Send(Message),
    Shutdown,
}

/// What the reader task reports to the session owner.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Message),
    /// The read half ended. `None` is a clean end of stream.
    Closed(Option<ChannelError>),
}

pub(crate) struct ChannelTasks {
    pub writer_tx: mpsc::UnboundedSender<WriterCommand>,
    pub inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    pub reader_handle: JoinHandle<()>,
    pub writer_handle: JoinHandle<()>,
}

/// Split `channel` into a reader task and a writer task.
pub(crate) fn spawn(channel: ByteChannel, trace: MessageTrace) -> ChannelTasks {
    let ByteChannel { reader, writer } = channel;

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriterCommand>();
    let writer_trace = trace.clone();
    let writer_handle = tokio::spawn(async move {
        let mut writer = FrameWriter::new(writer);
        while let Some(cmd) = writer_rx.recv().await {
            match cmd {
                WriterCommand::Send(message) => {
                    writer_trace.outgoing(&message);
                    let body = match message::encode(&message) {
                        Ok(body) => body,
                        Err(e) => {
                            tracing::warn!("Failed to encode outgoing message: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = writer.write_frame(&body).await {
                        if e.is_peer_closed() {
                            tracing::debug!("Worker closed its input: {e}");
                        } else {
                            tracing::warn!("Write error on worker channel: {e}");
                        }
                        break;
                    }
                }
                WriterCommand::Shutdown => break,
            }
        }
        let _ = writer.shutdown().await;
    });

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();
    let reader_handle = tokio::spawn(async move {
        let mut reader = FrameReader::new(reader);
        loop {
            match reader.read_frame().await {
                Ok(Some(body)) => match message::decode(&body) {
                    Ok(message) => {
                        trace.incoming(&message);
                        if inbound_tx.send(Inbound::Message(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Dropping malformed message from worker: {e}");
                    }
                },
                Ok(None) => {
                    tracing::debug!("Worker channel reached end of stream");
                    let _ = inbound_tx.send(Inbound::Closed(None));
                    break;
                }
                Err(e) => {
                    tracing::warn!("Worker channel read error: {e}");
                    let _ = inbound_tx.send(Inbound::Closed(Some(e)));
                    break;
                }
            }
        }
    });

    ChannelTasks {
        writer_tx,
        inbound_rx,
        reader_handle,
        writer_handle,
    }
}
