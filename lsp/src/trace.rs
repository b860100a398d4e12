//! Message trace written to the log under the `conduit_lsp::trace` target.
//!
//! The level lives in an atomic shared by the reader and writer tasks so the
//! host can change it at any time without touching the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use conduit_types::TraceLevel;

use crate::message::{Message, Response};

#[derive(Debug, Clone)]
pub(crate) struct MessageTrace {
    level: Arc<AtomicU8>,
}

impl MessageTrace {
    pub fn new(level: TraceLevel) -> Self {
        Self {
            level: Arc::new(AtomicU8::new(level.as_u8())),
        }
    }

    pub fn set(&self, level: TraceLevel) {
        self.level.store(level.as_u8(), Ordering::Relaxed);
    }

    pub fn level(&self) -> TraceLevel {
        TraceLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn outgoing(&self, message: &Message) {
        self.record("send", message);
    }

    pub fn incoming(&self, message: &Message) {
        self.record("recv", message);
    }

    fn record(&self, direction: &'static str, message: &Message) {
        match self.level() {
            TraceLevel::Off => {}
            TraceLevel::Messages => {
                tracing::info!(target: "conduit_lsp::trace", "{direction} {}", summary(message));
            }
            TraceLevel::Verbose => {
                let payload = payload(message);
                tracing::info!(
                    target: "conduit_lsp::trace",
                    "{direction} {}: {payload}",
                    summary(message)
                );
            }
        }
    }
}

fn summary(message: &Message) -> String {
    match message {
        Message::Request(req) => format!("request '{}' ({})", req.method, req.id),
        Message::Notification(note) => format!("notification '{}'", note.method),
        Message::Response(Response { id: Some(id), .. }) => format!("response ({id})"),
        Message::Response(Response { id: None, .. }) => "response (no id)".to_string(),
    }
}

fn payload(message: &Message) -> String {
    let value = match message {
        Message::Request(req) => req.params.as_ref(),
        Message::Notification(note) => note.params.as_ref(),
        Message::Response(resp) => {
            return match &resp.outcome {
                Ok(result) => result.to_string(),
                Err(error) => format!("error {error}"),
            };
        }
    };
    value.map_or_else(|| "no params".to_string(), ToString::to_string)
}
