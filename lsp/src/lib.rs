//! Language protocol client backed by an external worker process.
//!
//! [`LspClient`] launches the worker (or takes a ready channel), performs the
//! `initialize` handshake, and maps host document and file events onto
//! protocol notifications. All session state lives in one owner task; the
//! client is a thin handle that sends it commands.

pub mod codec;
pub mod message;
pub mod process;
pub mod protocol;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

mod capabilities;
mod client;
mod error;
mod selector;
mod session;
mod sync;
mod trace;
mod watch;

pub use capabilities::{Capabilities, ClientCapabilities, SaveOptions, ServerCapabilities, SyncKind};
pub use client::{LspClient, PendingRequest};
pub use error::{ClientError, HandshakeError};
pub use process::{LaunchError, WorkerHandle, WorkerState};
pub use selector::DocumentSelector;
pub use session::SessionState;
pub use sync::DocumentEvent;
pub use transport::{ByteChannel, ChannelError};
pub use watch::{FileChangeKind, FileEvent, FileWatcher};

pub use conduit_types::{
    ClientConfig, DocumentFilterConfig, TraceLevel, TransportConfig, WorkerConfig,
};
