//! Document synchronization over a live session.

use conduit_lsp::message::Notification;
use serde_json::{Value, json};
use url::Url;

use crate::common::{connected_client, file_uri, full_capabilities};

fn text_document(note: &Notification) -> &Value {
    &note.params.as_ref().unwrap()["textDocument"]
}

#[tokio::test]
async fn documents_seen_before_activation_open_with_current_text() {
    let (mut client, mut worker) = connected_client();
    let main = file_uri("main.desc");
    let lib = file_uri("lib.desc");

    client.did_open(main.clone(), "desc", "alpha\n").unwrap();
    client.did_open(lib.clone(), "desc", "lib\n").unwrap();
    client.did_change(main.clone(), "alpha\nbeta\n").unwrap();

    let worker_task = tokio::spawn(async move {
        worker.handshake(full_capabilities()).await;
        let mut opened = Vec::new();
        for _ in 0..2 {
            let note = worker.expect_notification("textDocument/didOpen").await;
            opened.push(text_document(&note).clone());
        }
        (worker, opened)
    });

    client.start().await.unwrap();
    let (_worker, opened) = worker_task.await.unwrap();

    assert_eq!(opened[0]["uri"], main.as_str());
    assert_eq!(opened[0]["version"], 1);
    assert_eq!(opened[0]["languageId"], "desc");
    assert_eq!(opened[0]["text"], "alpha\nbeta\n");
    assert_eq!(opened[1]["uri"], lib.as_str());
    assert_eq!(opened[1]["version"], 1);
}

#[tokio::test]
async fn versions_increase_and_close_comes_last() {
    let (mut client, mut worker) = connected_client();
    let uri = file_uri("versions.desc");

    let worker_task = tokio::spawn(async move {
        worker.handshake(full_capabilities()).await;
        let mut seen = Vec::new();
        loop {
            let note = match worker.recv().await {
                conduit_lsp::message::Message::Notification(note) => note,
                other => panic!("unexpected {other:?}"),
            };
            let done = note.method == "textDocument/didClose";
            seen.push(note);
            if done {
                break;
            }
        }
        seen
    });

    client.start().await.unwrap();
    client.did_open(uri.clone(), "desc", "one\n").unwrap();
    client.did_change(uri.clone(), "one\ntwo\n").unwrap();
    // Unchanged text produces nothing.
    client.did_change(uri.clone(), "one\ntwo\n").unwrap();
    client.did_change(uri.clone(), "one\n2\n").unwrap();
    client.did_save(uri.clone()).unwrap();
    client.did_close(uri.clone()).unwrap();
    // After close the document is gone; further edits are ignored.
    client.did_change(uri.clone(), "late\n").unwrap();

    let seen = worker_task.await.unwrap();
    let methods: Vec<&str> = seen.iter().map(|n| n.method.as_str()).collect();
    assert_eq!(
        methods,
        [
            "textDocument/didOpen",
            "textDocument/didChange",
            "textDocument/didChange",
            "textDocument/didSave",
            "textDocument/didClose",
        ]
    );

    let versions: Vec<i64> = seen[..3]
        .iter()
        .map(|n| text_document(n)["version"].as_i64().unwrap())
        .collect();
    assert_eq!(versions, [1, 2, 3]);

    let first_change = &seen[1].params.as_ref().unwrap()["contentChanges"][0];
    assert_eq!(
        first_change["range"],
        json!({ "start": { "line": 1, "character": 0 }, "end": { "line": 1, "character": 0 } })
    );
    assert_eq!(first_change["text"], "two\n");

    let second_change = &seen[2].params.as_ref().unwrap()["contentChanges"][0];
    assert_eq!(
        second_change["range"],
        json!({ "start": { "line": 1, "character": 0 }, "end": { "line": 1, "character": 3 } })
    );
    assert_eq!(second_change["text"], "2");

    assert_eq!(seen[3].params.as_ref().unwrap()["text"], "one\n2\n");
}

#[tokio::test]
async fn full_sync_sends_whole_text() {
    let (mut client, mut worker) = connected_client();
    let uri = file_uri("full.desc");
    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({ "textDocumentSync": 1 })).await;
        worker.expect_notification("textDocument/didOpen").await;
        let change = worker.expect_notification("textDocument/didChange").await;
        // Number form: no didSave, straight to close.
        let close = worker.expect_notification("textDocument/didClose").await;
        (change, close)
    });

    client.start().await.unwrap();
    client.did_open(uri.clone(), "desc", "a").unwrap();
    client.did_change(uri.clone(), "ab").unwrap();
    client.did_save(uri.clone()).unwrap();
    client.did_close(uri.clone()).unwrap();

    let (change, close) = worker_task.await.unwrap();
    let params = change.params.unwrap();
    assert_eq!(params["textDocument"]["version"], 2);
    assert_eq!(params["contentChanges"], json!([{ "text": "ab" }]));
    assert_eq!(close.params.unwrap()["textDocument"]["uri"], uri.as_str());
}

#[tokio::test]
async fn unselected_documents_are_not_synced() {
    let (mut client, mut worker) = connected_client();
    let scratch = Url::parse("untitled:Untitled-1").unwrap();
    let worker_task = tokio::spawn(async move {
        worker.handshake(full_capabilities()).await;
        // The first thing after the handshake is the hover request, not a
        // didOpen for the scratch buffer.
        let req = worker.expect_request("textDocument/hover").await;
        worker.reply(req.id, Value::Null).await;
        worker
    });

    client.start().await.unwrap();
    client.did_open(scratch.clone(), "desc", "scratch").unwrap();
    client.did_change(scratch, "scratch 2").unwrap();
    let hover = client
        .send_request("textDocument/hover", Some(json!({})))
        .await
        .unwrap();
    assert!(hover.is_null());
    let _worker = worker_task.await.unwrap();
}

#[tokio::test]
async fn rename_closes_old_and_opens_new() {
    let (mut client, mut worker) = connected_client();
    let old = file_uri("before.desc");
    let new = file_uri("after.desc");
    let worker_task = tokio::spawn(async move {
        worker.handshake(full_capabilities()).await;
        worker.expect_notification("textDocument/didOpen").await;
        let close = worker.expect_notification("textDocument/didClose").await;
        let open = worker.expect_notification("textDocument/didOpen").await;
        (close, open)
    });

    client.start().await.unwrap();
    client.did_open(old.clone(), "desc", "body").unwrap();
    client.did_rename(old.clone(), new.clone()).unwrap();

    let (close, open) = worker_task.await.unwrap();
    assert_eq!(text_document(&close)["uri"], old.as_str());
    let opened = text_document(&open);
    assert_eq!(opened["uri"], new.as_str());
    assert_eq!(opened["version"], 1);
    assert_eq!(opened["text"], "body");
}
