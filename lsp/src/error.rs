//! Client-facing error types.

use std::time::Duration;

use crate::message::ResponseError;
use crate::process::{LaunchError, WorkerState};
use crate::session::SessionState;

/// Errors returned by [`crate::LspClient`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to launch worker: {0}")]
    LaunchFailure(#[source] LaunchError),

    #[error("handshake failed: {0}")]
    HandshakeFailure(#[source] HandshakeError),

    /// The session is past the point of accepting traffic.
    #[error("session is not active ({0})")]
    SessionNotActive(SessionState),

    /// The session ended while the request was outstanding.
    #[error("session terminated")]
    SessionTerminated,

    /// The worker answered with an error object.
    #[error("worker returned an error: {0}")]
    Request(#[source] ResponseError),

    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out")]
    Timeout,

    #[error("invalid watch pattern: {0}")]
    WatchPattern(#[from] globset::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why the `initialize` exchange did not produce an active session.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("worker rejected initialize: {0}")]
    Rejected(#[source] ResponseError),

    #[error("malformed initialize result: {0}")]
    MalformedResult(String),

    #[error("worker {0} during handshake")]
    WorkerExited(WorkerState),

    #[error("channel closed during handshake")]
    ChannelClosed,
}
