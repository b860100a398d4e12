//! Document synchronization.
//!
//! Turns host document events into `didOpen`/`didChange`/`didSave`/`didClose`
//! notifications. Every selected document is tracked from the moment the
//! host reports it, whether or not the session is active yet; notifications
//! are only produced once capabilities are known, and documents tracked
//! earlier are opened by [`DocumentSync::activate`].
//!
//! Ordering per document: one open, then changes with strictly increasing
//! versions, then one close.

use std::collections::HashMap;

use url::Url;

use crate::capabilities::{Capabilities, SyncKind};
use crate::message::Notification;
use crate::protocol::{
    self, DidChangeTextDocument, DidChangeTextDocumentParams, DidCloseTextDocument,
    DidCloseTextDocumentParams, DidOpenTextDocument, DidOpenTextDocumentParams,
    DidSaveTextDocument, DidSaveTextDocumentParams, NotificationKind, Position, Range,
    TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem,
    VersionedTextDocumentIdentifier,
};
use crate::selector::DocumentSelector;

/// A document lifecycle event reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    Opened {
        uri: Url,
        language_id: String,
        text: String,
    },
    /// The full new text; the synchronizer computes what changed.
    Changed { uri: Url, text: String },
    Saved { uri: Url },
    Closed { uri: Url },
    Renamed { old_uri: Url, new_uri: Url },
}

#[derive(Debug)]
struct TrackedDocument {
    language_id: String,
    text: String,
    version: i32,
    /// `didOpen` has been sent.
    synced: bool,
    /// Order in which the host first reported the document.
    seq: u64,
}

#[derive(Debug)]
pub(crate) struct DocumentSync {
    selector: DocumentSelector,
    documents: HashMap<Url, TrackedDocument>,
    next_seq: u64,
}

impl DocumentSync {
    pub fn new(selector: DocumentSelector) -> Self {
        Self {
            selector,
            documents: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Apply one event. `caps` is `None` while the session is not active, in
    /// which case only the tracked state is updated.
    pub fn apply(&mut self, event: DocumentEvent, caps: Option<&Capabilities>) -> Vec<Notification> {
        let mut out = Vec::new();
        match event {
            DocumentEvent::Opened {
                uri,
                language_id,
                text,
            } => {
                if self.documents.contains_key(&uri) {
                    self.change(&uri, text, caps, &mut out);
                } else {
                    self.open(uri, language_id, text, caps, &mut out);
                }
            }
            DocumentEvent::Changed { uri, text } => self.change(&uri, text, caps, &mut out),
            DocumentEvent::Saved { uri } => self.save(&uri, caps, &mut out),
            DocumentEvent::Closed { uri } => self.close(&uri, caps, &mut out),
            DocumentEvent::Renamed { old_uri, new_uri } => {
                let Some(doc) = self.documents.get(&old_uri) else {
                    tracing::debug!("Ignoring rename of untracked document {old_uri}");
                    return out;
                };
                if old_uri == new_uri {
                    return out;
                }
                let language_id = doc.language_id.clone();
                let text = doc.text.clone();
                self.close(&old_uri, caps, &mut out);
                // The target's own descriptor ends before the renamed one opens.
                self.close(&new_uri, caps, &mut out);
                self.open(new_uri, language_id, text, caps, &mut out);
            }
        }
        out
    }

    /// Open every tracked document not yet announced, in the order the host
    /// reported them, at version 1.
    pub fn activate(&mut self, caps: &Capabilities) -> Vec<Notification> {
        let mut out = Vec::new();
        if !caps.open_close {
            return out;
        }
        let mut pending: Vec<(&Url, &mut TrackedDocument)> = self
            .documents
            .iter_mut()
            .filter(|(_, doc)| !doc.synced)
            .collect();
        pending.sort_by_key(|(_, doc)| doc.seq);
        for (uri, doc) in pending {
            doc.version = 1;
            doc.synced = true;
            push::<DidOpenTextDocument>(&mut out, &open_params(uri, doc));
        }
        out
    }

    #[cfg(test)]
    fn version(&self, uri: &Url) -> Option<i32> {
        self.documents.get(uri).map(|doc| doc.version)
    }

    fn open(
        &mut self,
        uri: Url,
        language_id: String,
        text: String,
        caps: Option<&Capabilities>,
        out: &mut Vec<Notification>,
    ) {
        if !self.selector.matches(&uri, &language_id) {
            tracing::debug!("Document {uri} is not selected");
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut doc = TrackedDocument {
            language_id,
            text,
            version: 1,
            synced: false,
            seq,
        };
        if caps.is_some_and(|c| c.open_close) {
            doc.synced = true;
            push::<DidOpenTextDocument>(out, &open_params(&uri, &doc));
        }
        self.documents.insert(uri, doc);
    }

    fn change(
        &mut self,
        uri: &Url,
        text: String,
        caps: Option<&Capabilities>,
        out: &mut Vec<Notification>,
    ) {
        let Some(doc) = self.documents.get_mut(uri) else {
            tracing::debug!("Skipping change for untracked document {uri}");
            return;
        };
        if doc.text == text {
            return;
        }
        let sync_kind = caps.map_or(SyncKind::None, |c| c.sync_kind);
        if !doc.synced || sync_kind == SyncKind::None {
            doc.text = text;
            return;
        }

        let change = match sync_kind {
            SyncKind::Incremental => incremental_change(&doc.text, &text),
            _ => TextDocumentContentChangeEvent {
                range: None,
                text: text.clone(),
            },
        };
        doc.version += 1;
        doc.text = text;
        push::<DidChangeTextDocument>(
            out,
            &DidChangeTextDocumentParams {
                text_document: VersionedTextDocumentIdentifier {
                    uri: uri.to_string(),
                    version: doc.version,
                },
                content_changes: vec![change],
            },
        );
    }

    fn save(&self, uri: &Url, caps: Option<&Capabilities>, out: &mut Vec<Notification>) {
        let Some(doc) = self.documents.get(uri) else {
            return;
        };
        let Some(save) = caps.and_then(|c| c.save) else {
            return;
        };
        if !doc.synced {
            return;
        }
        push::<DidSaveTextDocument>(
            out,
            &DidSaveTextDocumentParams {
                text_document: TextDocumentIdentifier {
                    uri: uri.to_string(),
                },
                text: save.include_text.then(|| doc.text.clone()),
            },
        );
    }

    fn close(&mut self, uri: &Url, caps: Option<&Capabilities>, out: &mut Vec<Notification>) {
        let Some(doc) = self.documents.remove(uri) else {
            return;
        };
        if doc.synced && caps.is_some() {
            push::<DidCloseTextDocument>(
                out,
                &DidCloseTextDocumentParams {
                    text_document: TextDocumentIdentifier {
                        uri: uri.to_string(),
                    },
                },
            );
        }
    }
}

fn open_params(uri: &Url, doc: &TrackedDocument) -> DidOpenTextDocumentParams {
    DidOpenTextDocumentParams {
        text_document: TextDocumentItem {
            uri: uri.to_string(),
            language_id: doc.language_id.clone(),
            version: doc.version,
            text: doc.text.clone(),
        },
    }
}

fn push<N: NotificationKind>(out: &mut Vec<Notification>, params: &N::Params) {
    match protocol::notification::<N>(params) {
        Ok(note) => out.push(note),
        Err(e) => tracing::warn!("Failed to serialize {}: {e}", N::METHOD),
    }
}

/// A single range edit turning `old` into `new`.
///
/// The edited span is whatever lies between the longest common prefix and
/// the longest common suffix. Boundaries never split a `\r\n` pair.
fn incremental_change(old: &str, new: &str) -> TextDocumentContentChangeEvent {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();
    let max_common = old_chars.len().min(new_chars.len());

    let mut prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();
    while prefix > 0 && (splits_crlf(&old_chars, prefix) || splits_crlf(&new_chars, prefix)) {
        prefix -= 1;
    }

    let mut suffix = old_chars[prefix..]
        .iter()
        .rev()
        .zip(new_chars[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count()
        .min(max_common - prefix);
    while suffix > 0
        && (splits_crlf(&old_chars, old_chars.len() - suffix)
            || splits_crlf(&new_chars, new_chars.len() - suffix))
    {
        suffix -= 1;
    }

    let old_end = old_chars.len() - suffix;
    let new_end = new_chars.len() - suffix;
    TextDocumentContentChangeEvent {
        range: Some(Range {
            start: position_at(&old_chars, prefix),
            end: position_at(&old_chars, old_end),
        }),
        text: new_chars[prefix..new_end].iter().collect(),
    }
}

fn splits_crlf(chars: &[char], index: usize) -> bool {
    index > 0 && index < chars.len() && chars[index - 1] == '\r' && chars[index] == '\n'
}

/// Line and UTF-16 column of the char at `index`. `\n`, `\r\n` and a lone
/// `\r` each end a line.
fn position_at(chars: &[char], index: usize) -> Position {
    let mut line = 0u32;
    let mut character = 0u32;
    for (i, &c) in chars[..index].iter().enumerate() {
        match c {
            '\n' => {
                line += 1;
                character = 0;
            }
            '\r' if chars.get(i + 1) == Some(&'\n') => {}
            '\r' => {
                line += 1;
                character = 0;
            }
            _ => character += c.len_utf16() as u32,
        }
    }
    Position { line, character }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::SaveOptions;
    use conduit_types::DocumentFilterConfig;
    use serde_json::Value;

    fn caps(sync_kind: SyncKind) -> Capabilities {
        Capabilities {
            sync_kind,
            open_close: true,
            save: Some(SaveOptions { include_text: true }),
            hover: true,
            completion: true,
            definition: true,
            watched_files: true,
        }
    }

    fn sync() -> DocumentSync {
        let filter = DocumentFilterConfig::new(Some("file"), None, Some("**/*.desc")).unwrap();
        DocumentSync::new(DocumentSelector::from_config(&[filter]))
    }

    fn uri(path: &str) -> Url {
        Url::parse(&format!("file:///work/{path}")).unwrap()
    }

    fn opened(path: &str, text: &str) -> DocumentEvent {
        DocumentEvent::Opened {
            uri: uri(path),
            language_id: "descend".into(),
            text: text.into(),
        }
    }

    fn changed(path: &str, text: &str) -> DocumentEvent {
        DocumentEvent::Changed {
            uri: uri(path),
            text: text.into(),
        }
    }

    fn methods(notes: &[Notification]) -> Vec<&str> {
        notes.iter().map(|n| n.method.as_str()).collect()
    }

    fn version_of(note: &Notification) -> i64 {
        note.params.as_ref().unwrap()["textDocument"]["version"]
            .as_i64()
            .unwrap()
    }

    /// Inverse of `position_at`, for applying edits in tests.
    fn offset_at(chars: &[char], pos: Position) -> usize {
        let mut line = 0;
        let mut i = 0;
        while line < pos.line {
            match chars[i] {
                '\n' => line += 1,
                '\r' if chars.get(i + 1) != Some(&'\n') => line += 1,
                _ => {}
            }
            i += 1;
        }
        let mut units = 0;
        while units < pos.character {
            units += chars[i].len_utf16() as u32;
            i += 1;
        }
        i
    }

    fn apply_edit(old: &str, change: &TextDocumentContentChangeEvent) -> String {
        let chars: Vec<char> = old.chars().collect();
        let range = change.range.unwrap();
        let start = offset_at(&chars, range.start);
        let end = offset_at(&chars, range.end);
        let mut out: String = chars[..start].iter().collect();
        out.push_str(&change.text);
        out.extend(&chars[end..]);
        out
    }

    #[test]
    fn open_then_changes_bump_versions() {
        let mut sync = sync();
        let caps = caps(SyncKind::Full);
        let notes = sync.apply(opened("a.desc", "one"), Some(&caps));
        assert_eq!(methods(&notes), ["textDocument/didOpen"]);
        assert_eq!(version_of(&notes[0]), 1);

        let notes = sync.apply(changed("a.desc", "two"), Some(&caps));
        assert_eq!(version_of(&notes[0]), 2);
        assert_eq!(notes[0].params.as_ref().unwrap()["contentChanges"][0]["text"], "two");
        let notes = sync.apply(changed("a.desc", "three"), Some(&caps));
        assert_eq!(version_of(&notes[0]), 3);
    }

    #[test]
    fn identical_text_sends_nothing() {
        let mut sync = sync();
        let caps = caps(SyncKind::Full);
        sync.apply(opened("a.desc", "same"), Some(&caps));
        assert!(sync.apply(changed("a.desc", "same"), Some(&caps)).is_empty());
        assert_eq!(sync.version(&uri("a.desc")), Some(1));
    }

    #[test]
    fn unselected_documents_are_ignored() {
        let mut sync = sync();
        let caps = caps(SyncKind::Full);
        assert!(sync.apply(opened("a.rs", "fn main() {}"), Some(&caps)).is_empty());
        assert!(sync.apply(changed("a.rs", "x"), Some(&caps)).is_empty());
        assert!(sync.version(&uri("a.rs")).is_none());
    }

    #[test]
    fn change_for_untracked_document_is_skipped() {
        let mut sync = sync();
        assert!(
            sync.apply(changed("b.desc", "x"), Some(&caps(SyncKind::Full)))
                .is_empty()
        );
    }

    #[test]
    fn documents_before_activation_open_in_order_with_current_text() {
        let mut sync = sync();
        assert!(sync.apply(opened("b.desc", "b0"), None).is_empty());
        assert!(sync.apply(opened("a.desc", "a0"), None).is_empty());
        assert!(sync.apply(changed("b.desc", "b1"), None).is_empty());

        let notes = sync.activate(&caps(SyncKind::Full));
        assert_eq!(notes.len(), 2);
        let first = &notes[0].params.as_ref().unwrap()["textDocument"];
        assert_eq!(first["uri"], "file:///work/b.desc");
        assert_eq!(first["text"], "b1");
        assert_eq!(first["version"], 1);
        assert_eq!(
            notes[1].params.as_ref().unwrap()["textDocument"]["uri"],
            "file:///work/a.desc"
        );
        assert!(sync.activate(&caps(SyncKind::Full)).is_empty());
    }

    #[test]
    fn close_before_activation_sends_nothing_later() {
        let mut sync = sync();
        sync.apply(opened("a.desc", "a"), None);
        sync.apply(DocumentEvent::Closed { uri: uri("a.desc") }, None);
        assert!(sync.activate(&caps(SyncKind::Full)).is_empty());
    }

    #[test]
    fn save_follows_negotiated_options() {
        let mut sync = sync();
        let mut caps = caps(SyncKind::Full);
        sync.apply(opened("a.desc", "body"), Some(&caps));
        let notes = sync.apply(DocumentEvent::Saved { uri: uri("a.desc") }, Some(&caps));
        assert_eq!(methods(&notes), ["textDocument/didSave"]);
        assert_eq!(notes[0].params.as_ref().unwrap()["text"], "body");

        caps.save = Some(SaveOptions {
            include_text: false,
        });
        let notes = sync.apply(DocumentEvent::Saved { uri: uri("a.desc") }, Some(&caps));
        assert!(notes[0].params.as_ref().unwrap().get("text").is_none());

        caps.save = None;
        assert!(
            sync.apply(DocumentEvent::Saved { uri: uri("a.desc") }, Some(&caps))
                .is_empty()
        );
    }

    #[test]
    fn close_drops_descriptor() {
        let mut sync = sync();
        let caps = caps(SyncKind::Full);
        sync.apply(opened("a.desc", "x"), Some(&caps));
        let notes = sync.apply(DocumentEvent::Closed { uri: uri("a.desc") }, Some(&caps));
        assert_eq!(methods(&notes), ["textDocument/didClose"]);
        assert!(sync.version(&uri("a.desc")).is_none());

        // Reopening starts over at version 1.
        let notes = sync.apply(opened("a.desc", "y"), Some(&caps));
        assert_eq!(version_of(&notes[0]), 1);
    }

    #[test]
    fn rename_to_matching_uri_reopens() {
        let mut sync = sync();
        let caps = caps(SyncKind::Full);
        sync.apply(opened("a.desc", "text"), Some(&caps));
        let notes = sync.apply(
            DocumentEvent::Renamed {
                old_uri: uri("a.desc"),
                new_uri: uri("b.desc"),
            },
            Some(&caps),
        );
        assert_eq!(
            methods(&notes),
            ["textDocument/didClose", "textDocument/didOpen"]
        );
        assert_eq!(
            notes[1].params.as_ref().unwrap()["textDocument"]["text"],
            "text"
        );
    }

    #[test]
    fn rename_onto_open_document_closes_it_first() {
        let mut sync = sync();
        let caps = caps(SyncKind::Full);
        sync.apply(opened("a.desc", "from a"), Some(&caps));
        sync.apply(opened("b.desc", "b1"), Some(&caps));
        sync.apply(changed("b.desc", "b2"), Some(&caps));
        sync.apply(changed("b.desc", "b3"), Some(&caps));
        assert_eq!(sync.version(&uri("b.desc")), Some(3));

        let notes = sync.apply(
            DocumentEvent::Renamed {
                old_uri: uri("a.desc"),
                new_uri: uri("b.desc"),
            },
            Some(&caps),
        );
        assert_eq!(
            methods(&notes),
            [
                "textDocument/didClose",
                "textDocument/didClose",
                "textDocument/didOpen"
            ]
        );
        let closed: Vec<&Value> = notes[..2]
            .iter()
            .map(|n| &n.params.as_ref().unwrap()["textDocument"]["uri"])
            .collect();
        assert_eq!(closed, ["file:///work/a.desc", "file:///work/b.desc"]);
        let reopened = &notes[2].params.as_ref().unwrap()["textDocument"];
        assert_eq!(reopened["text"], "from a");
        assert_eq!(reopened["version"], 1);

        // The next change belongs to the fresh open.
        let notes = sync.apply(changed("b.desc", "edited"), Some(&caps));
        assert_eq!(version_of(&notes[0]), 2);
        assert!(sync.version(&uri("a.desc")).is_none());
    }

    #[test]
    fn rename_onto_itself_is_a_no_op() {
        let mut sync = sync();
        let caps = caps(SyncKind::Full);
        sync.apply(opened("a.desc", "text"), Some(&caps));
        sync.apply(changed("a.desc", "text 2"), Some(&caps));
        let notes = sync.apply(
            DocumentEvent::Renamed {
                old_uri: uri("a.desc"),
                new_uri: uri("a.desc"),
            },
            Some(&caps),
        );
        assert!(notes.is_empty());
        assert_eq!(sync.version(&uri("a.desc")), Some(2));
    }

    #[test]
    fn rename_to_unselected_uri_only_closes() {
        let mut sync = sync();
        let caps = caps(SyncKind::Full);
        sync.apply(opened("a.desc", "text"), Some(&caps));
        let notes = sync.apply(
            DocumentEvent::Renamed {
                old_uri: uri("a.desc"),
                new_uri: uri("a.txt"),
            },
            Some(&caps),
        );
        assert_eq!(methods(&notes), ["textDocument/didClose"]);
        assert!(sync.version(&uri("a.txt")).is_none());
    }

    #[test]
    fn worker_without_open_close_gets_nothing() {
        let mut sync = sync();
        let mut caps = caps(SyncKind::Full);
        caps.open_close = false;
        assert!(sync.apply(opened("a.desc", "x"), Some(&caps)).is_empty());
        assert!(sync.apply(changed("a.desc", "y"), Some(&caps)).is_empty());
        assert!(sync.activate(&caps).is_empty());
    }

    #[test]
    fn incremental_change_sends_a_range() {
        let mut sync = sync();
        let caps = caps(SyncKind::Incremental);
        sync.apply(opened("a.desc", "let x = 1;\nlet y = 2;\n"), Some(&caps));
        let notes = sync.apply(changed("a.desc", "let x = 1;\nlet y = 7;\n"), Some(&caps));
        let change: TextDocumentContentChangeEvent = serde_json::from_value(
            notes[0].params.as_ref().unwrap()["contentChanges"][0].clone(),
        )
        .unwrap();
        assert_eq!(
            change.range,
            Some(Range {
                start: Position::new(1, 8),
                end: Position::new(1, 9),
            })
        );
        assert_eq!(change.text, "7");
    }

    #[test]
    fn incremental_edits_reproduce_new_text() {
        let cases = [
            ("", "hello"),
            ("hello", ""),
            ("abc", "abc\n"),
            ("aaa", "aaaa"),
            ("line1\r\nline2", "line1\r\nline2\r\n"),
            ("a\r\nb", "a\nb"),
            ("a\nb", "a\r\nb"),
            ("x\ry", "x\r\ny"),
            ("héllo 𝄞 wörld", "héllo 𝄞 there wörld"),
            ("𝄞𝄞", "𝄞x𝄞"),
            ("fn f() {\n    1\n}\n", "fn f() {\n    2\n}\n// end\n"),
        ];
        for (old, new) in cases {
            let change = incremental_change(old, new);
            assert_eq!(apply_edit(old, &change), new, "edit {old:?} -> {new:?}");
        }
    }

    #[test]
    fn utf16_columns() {
        let chars: Vec<char> = "a𝄞b".chars().collect();
        // 𝄞 is two UTF-16 code units.
        assert_eq!(position_at(&chars, 2), Position::new(0, 3));
    }
}
