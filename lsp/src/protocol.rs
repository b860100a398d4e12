//! Typed method markers and the wire structures they carry.
//!
//! Each marker ties a method name to its params and result schema, so the
//! facade can offer `request::<HoverRequest>(..)` instead of raw strings. Only the
//! fields this client reads or writes are modelled; everything else stays in
//! `serde_json::Value`.

use std::path::{Path, PathBuf};

use conduit_types::TraceLevel;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::message::{Notification, Request, RequestId, Response, ResponseError};

/// A request method with its params and result types.
pub trait RequestKind {
    const METHOD: &'static str;
    type Params: Serialize;
    type Result: DeserializeOwned;
}

/// A notification method with its params type.
pub trait NotificationKind {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned;
}

macro_rules! request_kind {
    ($name:ident, $method:literal, $params:ty, $result:ty) => {
        #[derive(Debug)]
        pub enum $name {}

        impl RequestKind for $name {
            const METHOD: &'static str = $method;
            type Params = $params;
            type Result = $result;
        }
    };
}

macro_rules! notification_kind {
    ($name:ident, $method:literal, $params:ty) => {
        #[derive(Debug)]
        pub enum $name {}

        impl NotificationKind for $name {
            const METHOD: &'static str = $method;
            type Params = $params;
        }
    };
}

request_kind!(Initialize, "initialize", Value, InitializeResult);
request_kind!(Shutdown, "shutdown", (), ());
request_kind!(HoverRequest, "textDocument/hover", TextDocumentPositionParams, Option<Hover>);
request_kind!(
    Completion,
    "textDocument/completion",
    TextDocumentPositionParams,
    Option<CompletionResponse>
);
request_kind!(
    GotoDefinition,
    "textDocument/definition",
    TextDocumentPositionParams,
    Option<DefinitionResponse>
);

notification_kind!(Initialized, "initialized", InitializedParams);
notification_kind!(Exit, "exit", ());
notification_kind!(Cancel, "$/cancelRequest", CancelParams);
notification_kind!(DidOpenTextDocument, "textDocument/didOpen", DidOpenTextDocumentParams);
notification_kind!(
    DidChangeTextDocument,
    "textDocument/didChange",
    DidChangeTextDocumentParams
);
notification_kind!(DidSaveTextDocument, "textDocument/didSave", DidSaveTextDocumentParams);
notification_kind!(
    DidCloseTextDocument,
    "textDocument/didClose",
    DidCloseTextDocumentParams
);
notification_kind!(
    DidChangeWatchedFiles,
    "workspace/didChangeWatchedFiles",
    DidChangeWatchedFilesParams
);
notification_kind!(
    PublishDiagnostics,
    "textDocument/publishDiagnostics",
    PublishDiagnosticsParams
);
notification_kind!(LogMessage, "window/logMessage", LogMessageParams);
notification_kind!(ShowMessage, "window/showMessage", ShowMessageParams);

/// Serialize params for the wire. `()` and other null params are omitted.
pub(crate) fn encode_params<P: Serialize>(params: &P) -> Result<Option<Value>, serde_json::Error> {
    let value = serde_json::to_value(params)?;
    Ok((!value.is_null()).then_some(value))
}

/// Build a typed notification.
pub(crate) fn notification<N: NotificationKind>(
    params: &N::Params,
) -> Result<Notification, serde_json::Error> {
    Ok(Notification {
        method: N::METHOD.to_string(),
        params: encode_params(params)?,
    })
}

/// Zero-based line and UTF-16 column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationLink {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_selection_range: Option<Range>,
    pub target_uri: String,
    pub target_range: Range,
    pub target_selection_range: Range,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDocumentIdentifier {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedTextDocumentIdentifier {
    pub uri: String,
    pub version: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentItem {
    pub uri: String,
    pub language_id: String,
    pub version: i32,
    pub text: String,
}

/// One entry of `contentChanges`. Without a range, `text` replaces the
/// whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDocumentContentChangeEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidOpenTextDocumentParams {
    pub text_document: TextDocumentItem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidChangeTextDocumentParams {
    pub text_document: VersionedTextDocumentIdentifier,
    pub content_changes: Vec<TextDocumentContentChangeEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidSaveTextDocumentParams {
    pub text_document: TextDocumentIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidCloseTextDocumentParams {
    pub text_document: TextDocumentIdentifier,
}

/// Numeric `FileChangeType`: 1 created, 2 changed, 3 deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FileChangeType {
    Created,
    Changed,
    Deleted,
}

impl From<FileChangeType> for u8 {
    fn from(value: FileChangeType) -> Self {
        match value {
            FileChangeType::Created => 1,
            FileChangeType::Changed => 2,
            FileChangeType::Deleted => 3,
        }
    }
}

impl TryFrom<u8> for FileChangeType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Created),
            2 => Ok(Self::Changed),
            3 => Ok(Self::Deleted),
            other => Err(format!("unknown file change type {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub uri: String,
    #[serde(rename = "type")]
    pub typ: FileChangeType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidChangeWatchedFilesParams {
    pub changes: Vec<FileEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializedParams {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentPositionParams {
    pub text_document: TextDocumentIdentifier,
    pub position: Position,
}

impl TextDocumentPositionParams {
    pub fn new(uri: impl Into<String>, position: Position) -> Self {
        Self {
            text_document: TextDocumentIdentifier { uri: uri.into() },
            position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hover {
    /// `MarkupContent`, `MarkedString` or an array of them.
    pub contents: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionItem {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionList {
    pub is_incomplete: bool,
    pub items: Vec<CompletionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompletionResponse {
    Array(Vec<CompletionItem>),
    List(CompletionList),
}

impl CompletionResponse {
    #[must_use]
    pub fn items(&self) -> &[CompletionItem] {
        match self {
            Self::Array(items) => items,
            Self::List(list) => &list.items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefinitionResponse {
    Scalar(Location),
    Array(Vec<Location>),
    Link(Vec<LocationLink>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub message: String,
}

impl Diagnostic {
    /// Missing or out-of-range severities are reported as warnings.
    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
            .and_then(DiagnosticSeverity::from_lsp)
            .unwrap_or(DiagnosticSeverity::Warning)
    }

    /// Format as `path:line:col: severity: [source] message`, 1-indexed.
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.range.start.line + 1,
            self.range.start.character + 1,
            self.severity().label(),
            self.source.as_deref().unwrap_or("unknown"),
            self.message,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishDiagnosticsParams {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    pub diagnostics: Vec<Diagnostic>,
}

/// `MessageType` of `window/logMessage` and `window/showMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Error,
    Warning,
    Info,
    Log,
}

impl MessageType {
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Info),
            4 => Some(Self::Log),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessageParams {
    #[serde(rename = "type")]
    pub typ: u64,
    pub message: String,
}

impl LogMessageParams {
    #[must_use]
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_lsp(self.typ)
    }
}

pub type ShowMessageParams = LogMessageParams;

/// Everything the client needs to build `initialize` params.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InitializeArgs<'a> {
    pub root_uri: Option<&'a Url>,
    pub client_name: &'a str,
    pub capabilities: &'a Value,
    pub initialization_options: Option<&'a Value>,
    pub trace: TraceLevel,
}

pub(crate) fn initialize_params(args: InitializeArgs<'_>) -> Value {
    let workspace_folders = args.root_uri.map(|uri| {
        let name = uri
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
            .unwrap_or("workspace")
            .to_string();
        json!([{ "uri": uri.as_str(), "name": name }])
    });

    let mut params = json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": args.client_name,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "rootUri": args.root_uri.map(Url::as_str),
        "capabilities": args.capabilities,
        "workspaceFolders": workspace_folders,
        "trace": args.trace.as_str(),
    });
    if let Some(options) = args.initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

/// Answer a request the worker sent to us.
///
/// `workspace/configuration` gets one `null` per requested item, which tells
/// the worker to use its defaults. Registration and progress requests are
/// acknowledged. Anything else is `MethodNotFound`.
pub(crate) fn reply_to_worker_request(request: &Request) -> Response {
    let id = request.id.clone();
    match request.method.as_str() {
        "workspace/configuration" => {
            let count = request
                .params
                .as_ref()
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            Response::ok(id, Value::Array(vec![Value::Null; count]))
        }
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create" => Response::ok(id, Value::Null),
        method => Response::err(id, ResponseError::method_not_found(method)),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

pub fn path_to_file_uri(path: &Path) -> Result<Url, PathToUriError> {
    Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[must_use]
pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri).ok().and_then(|u| u.to_file_path().ok())
}
