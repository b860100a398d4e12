//! Watched-file events before and after activation.

use conduit_lsp::FileChangeKind;
use serde_json::{Value, json};

use crate::common::{connected_client, file_uri, project_path};

fn changes(params: Option<Value>) -> Vec<(String, u64)> {
    params.unwrap()["changes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| {
            (
                c["uri"].as_str().unwrap().to_string(),
                c["type"].as_u64().unwrap(),
            )
        })
        .collect()
}

#[tokio::test]
async fn events_before_and_after_activation_arrive_in_order() {
    let (mut client, mut worker) = connected_client();

    client
        .file_changed(project_path("config.json"), FileChangeKind::Created)
        .unwrap();
    client
        .file_changed(project_path("notes.txt"), FileChangeKind::Changed)
        .unwrap();
    client
        .file_changed(project_path("nested/config.json"), FileChangeKind::Changed)
        .unwrap();

    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({})).await;
        let batched = worker
            .expect_notification("workspace/didChangeWatchedFiles")
            .await;
        let live = worker
            .expect_notification("workspace/didChangeWatchedFiles")
            .await;
        (batched, live)
    });

    client.start().await.unwrap();
    client
        .file_changed(project_path("config.json"), FileChangeKind::Deleted)
        .unwrap();

    let (batched, live) = worker_task.await.unwrap();
    assert_eq!(
        changes(batched.params),
        [
            (file_uri("config.json").to_string(), 1),
            (file_uri("nested/config.json").to_string(), 2),
        ]
    );
    assert_eq!(
        changes(live.params),
        [(file_uri("config.json").to_string(), 3)]
    );
}

#[tokio::test]
async fn non_matching_events_are_never_sent() {
    let (mut client, mut worker) = connected_client();
    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({})).await;
        let req = worker.expect_request("custom/ping").await;
        worker.reply(req.id, json!("pong")).await;
        worker
    });

    client.start().await.unwrap();
    client
        .file_changed(project_path("src/main.desc"), FileChangeKind::Changed)
        .unwrap();
    let pong = client.send_request("custom/ping", None).await.unwrap();
    assert_eq!(pong, "pong");
    let _worker = worker_task.await.unwrap();
}

#[tokio::test]
async fn custom_pattern_relative_to_watch_root() {
    let root = tempfile::tempdir().unwrap();
    let config = crate::common::config()
        .with_watch_pattern("schemas/*.json")
        .unwrap()
        .with_watch_root(root.path());
    let (channel, mut worker) = crate::common::FakeWorker::pair();
    let mut client = conduit_lsp::LspClient::connect(config, channel);

    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({})).await;
        worker
            .expect_notification("workspace/didChangeWatchedFiles")
            .await
    });

    client.start().await.unwrap();
    let schema = root.path().join("schemas").join("a.json");
    client
        .file_changed(root.path().join("config.json"), FileChangeKind::Created)
        .unwrap();
    client
        .file_changed(&schema, FileChangeKind::Created)
        .unwrap();

    let note = worker_task.await.unwrap();
    let got = changes(note.params);
    assert_eq!(got.len(), 1);
    assert!(got[0].0.ends_with("schemas/a.json"), "{got:?}");
    client.stop().await;
}

#[tokio::test]
async fn files_written_under_watch_root_reach_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let root = std::fs::canonicalize(dir.path()).unwrap();
    let config = crate::common::config().with_watch_root(root.clone());
    let (channel, mut worker) = crate::common::FakeWorker::pair();
    let mut client = conduit_lsp::LspClient::connect(config, channel);

    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({})).await;
        let note = worker
            .expect_notification("workspace/didChangeWatchedFiles")
            .await;
        (worker, note)
    });

    client.start().await.unwrap();
    std::fs::write(root.join("notes.txt"), "ignored").unwrap();
    std::fs::write(root.join("config.json"), "{}").unwrap();

    let (_worker, note) = worker_task.await.unwrap();
    let got = changes(note.params);
    assert!(
        got.iter().all(|(uri, _)| uri.ends_with("/config.json")),
        "{got:?}"
    );
    assert!(matches!(got[0].1, 1 | 2), "{got:?}");
}
