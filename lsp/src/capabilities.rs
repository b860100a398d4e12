//! Capability negotiation.
//!
//! The client declares what it supports, the worker answers `initialize`
//! with what it provides, and [`Capabilities::negotiate`] keeps the
//! intersection. The result is fixed for the rest of the session.

use serde_json::{Value, json};

/// How document content changes are sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncKind {
    #[default]
    None,
    Full,
    Incremental,
}

impl SyncKind {
    /// `TextDocumentSyncKind` number: 0 none, 1 full, 2 incremental.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Full),
            2 => Some(Self::Incremental),
            _ => None,
        }
    }
}

/// Save notifications, with or without the document text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaveOptions {
    pub include_text: bool,
}

/// What this client declares during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCapabilities {
    pub sync_kind: SyncKind,
    pub did_save: bool,
    pub hover: bool,
    pub completion: bool,
    pub definition: bool,
    pub watched_files: bool,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            sync_kind: SyncKind::Incremental,
            did_save: true,
            hover: true,
            completion: true,
            definition: true,
            watched_files: true,
        }
    }
}

impl ClientCapabilities {
    /// The `capabilities` object of `initialize` params.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": self.did_save
                },
                "hover": {
                    "dynamicRegistration": false,
                    "contentFormat": ["markdown", "plaintext"]
                },
                "completion": {
                    "dynamicRegistration": false,
                    "completionItem": { "snippetSupport": false }
                },
                "definition": {
                    "dynamicRegistration": false,
                    "linkSupport": true
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            },
            "workspace": {
                "workspaceFolders": true,
                "configuration": true,
                "didChangeWatchedFiles": {
                    "dynamicRegistration": self.watched_files
                }
            },
            "window": {
                "workDoneProgress": false
            }
        })
    }
}

/// What the worker said it provides, read leniently from `initialize`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub open_close: bool,
    pub change: SyncKind,
    pub save: Option<SaveOptions>,
    pub hover: bool,
    pub completion: bool,
    pub definition: bool,
}

impl ServerCapabilities {
    /// Parse the `capabilities` object of an `initialize` result.
    ///
    /// Returns `None` when `value` is not an object. Unknown or mistyped
    /// fields count as "not provided".
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let mut caps = Self::default();

        match obj.get("textDocumentSync") {
            Some(Value::Number(n)) => {
                let kind = n.as_u64().and_then(SyncKind::from_lsp).unwrap_or_default();
                caps.open_close = kind != SyncKind::None;
                caps.change = kind;
            }
            Some(Value::Object(sync)) => {
                caps.open_close = sync.get("openClose").and_then(Value::as_bool) == Some(true);
                caps.change = sync
                    .get("change")
                    .and_then(Value::as_u64)
                    .and_then(SyncKind::from_lsp)
                    .unwrap_or_default();
                caps.save = match sync.get("save") {
                    Some(Value::Bool(true)) => Some(SaveOptions {
                        include_text: false,
                    }),
                    Some(Value::Object(save)) => Some(SaveOptions {
                        include_text: save.get("includeText").and_then(Value::as_bool)
                            == Some(true),
                    }),
                    _ => None,
                };
            }
            _ => {}
        }

        caps.hover = provided(obj.get("hoverProvider"));
        caps.completion = provided(obj.get("completionProvider"));
        caps.definition = provided(obj.get("definitionProvider"));
        Some(caps)
    }
}

/// `true` or an options object means provided; `false`/`null`/absent do not.
fn provided(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null | Value::Bool(false)) => false,
        Some(_) => true,
    }
}

/// The negotiated feature set of an active session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub sync_kind: SyncKind,
    pub open_close: bool,
    pub save: Option<SaveOptions>,
    pub hover: bool,
    pub completion: bool,
    pub definition: bool,
    pub watched_files: bool,
}

impl Capabilities {
    #[must_use]
    pub fn negotiate(client: &ClientCapabilities, server: &ServerCapabilities) -> Self {
        Self {
            sync_kind: client.sync_kind.min(server.change),
            open_close: server.open_close,
            save: if client.did_save { server.save } else { None },
            hover: client.hover && server.hover,
            completion: client.completion && server.completion,
            definition: client.definition && server.definition,
            watched_files: client.watched_files,
        }
    }
}
