//! Shared test utilities and fixtures
//!
//! Config and path fixtures around the crate's in-memory worker.

#![allow(dead_code)]

use std::path::PathBuf;

use conduit_lsp::{ClientConfig, LspClient, WorkerConfig, protocol};
use serde_json::{Value, json};
use url::Url;

pub use conduit_lsp::test_support::FakeWorker;

pub fn config() -> ClientConfig {
    ClientConfig::new(WorkerConfig::new("fake-worker").unwrap())
}

pub fn connected_client() -> (LspClient, FakeWorker) {
    let (channel, worker) = FakeWorker::pair();
    (LspClient::connect(config(), channel), worker)
}

pub fn project_path(rel: &str) -> PathBuf {
    std::env::temp_dir().join("conduit-project").join(rel)
}

pub fn file_uri(rel: &str) -> Url {
    protocol::path_to_file_uri(&project_path(rel)).unwrap()
}

/// Capabilities of a worker supporting everything with incremental sync.
pub fn full_capabilities() -> Value {
    json!({
        "textDocumentSync": {
            "openClose": true,
            "change": 2,
            "save": { "includeText": true }
        },
        "hoverProvider": true,
        "completionProvider": {},
        "definitionProvider": true
    })
}
