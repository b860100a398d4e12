//! Core configuration types for Conduit.
//!
//! This crate contains validated settings with no IO, no async, and minimal
//! dependencies. The client crate and the binary both consume these types;
//! only the binary knows how they are loaded from disk.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod settings;

pub use settings::{
    ClientConfig, DEFAULT_CLIENT_NAME, DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_SHUTDOWN_GRACE_MS,
    DEFAULT_WATCH_PATTERN, DocumentFilterConfig, SettingsError, TraceLevel, TransportConfig,
    WorkerConfig,
};
