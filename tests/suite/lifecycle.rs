//! Session lifecycle through the public client API.

use std::time::Duration;

use conduit_lsp::message::Message;
use conduit_lsp::protocol::{Completion, Position, TextDocumentPositionParams};
use conduit_lsp::{
    ClientConfig, ClientError, HandshakeError, LaunchError, LspClient, SessionState, SyncKind,
    WorkerConfig,
};
use serde_json::{Value, json};

use crate::common::{FakeWorker, connected_client, file_uri, full_capabilities};

#[tokio::test]
async fn nonexistent_command_fails_to_launch() {
    let config = ClientConfig::new(
        WorkerConfig::new("conduit-suite-definitely-not-installed").unwrap(),
    );
    let mut client = LspClient::new(config);
    let err = client.start().await.unwrap_err();
    assert!(
        matches!(err, ClientError::LaunchFailure(LaunchError::NotFound { .. })),
        "{err}"
    );
    assert_eq!(client.state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn handshake_then_immediate_completion() {
    let (mut client, mut worker) = connected_client();
    let states = client.subscribe_state();

    let worker_task = tokio::spawn(async move {
        let init = worker.expect_request("initialize").await;
        let params = init.params.clone().unwrap();
        assert_eq!(params["clientInfo"]["name"], "conduit");
        assert!(params["capabilities"]["textDocument"].is_object());
        worker
            .reply(init.id, json!({ "capabilities": full_capabilities() }))
            .await;
        worker.expect_notification("initialized").await;

        let req = worker.expect_request("textDocument/completion").await;
        worker
            .reply(req.id, json!({ "isIncomplete": false, "items": [{ "label": "frame" }] }))
            .await;
        worker
    });

    let caps = client.start().await.unwrap();
    assert_eq!(*states.borrow(), SessionState::Active);
    assert_eq!(caps.sync_kind, SyncKind::Incremental);
    assert!(caps.completion && caps.hover && caps.definition);
    assert_eq!(client.capabilities(), Some(caps));

    let params = TextDocumentPositionParams::new(file_uri("main.desc"), Position::new(0, 3));
    let response = client.request::<Completion>(&params).await.unwrap().unwrap();
    assert_eq!(response.items()[0].label, "frame");

    let _worker = worker_task.await.unwrap();
}

#[tokio::test]
async fn requests_issued_before_start_are_flushed_in_order() {
    let (mut client, mut worker) = connected_client();
    let first = client.begin_request("custom/first", Some(json!({ "n": 1 }))).unwrap();
    let second = client.begin_request("custom/second", Some(json!({ "n": 2 }))).unwrap();

    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({})).await;
        for method in ["custom/first", "custom/second"] {
            let req = worker.expect_request(method).await;
            let n = req.params.as_ref().unwrap()["n"].clone();
            worker.reply(req.id, n).await;
        }
        worker
    });

    client.start().await.unwrap();
    assert_eq!(first.wait().await.unwrap(), json!(1));
    assert_eq!(second.wait().await.unwrap(), json!(2));
    let _worker = worker_task.await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (mut client, mut worker) = connected_client();
    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({})).await;
        let req = worker.expect_request("shutdown").await;
        worker.reply(req.id, Value::Null).await;
        worker.expect_notification("exit").await;
        // Nothing else is sent after exit.
        assert!(worker.try_recv().await.is_none());
    });

    client.start().await.unwrap();
    client.stop().await;
    assert_eq!(client.state(), SessionState::Stopped);
    client.stop().await;
    client.stop().await;
    assert_eq!(client.state(), SessionState::Stopped);
    worker_task.await.unwrap();

    assert!(matches!(
        client.send_request("textDocument/hover", None).await,
        Err(ClientError::SessionNotActive(SessionState::Stopped))
    ));
}

#[tokio::test]
async fn stop_without_acknowledgement_still_stops() {
    let config = crate::common::config().with_shutdown_grace(Duration::from_millis(50));
    let (channel, mut worker) = FakeWorker::pair();
    let mut client = LspClient::connect(config, channel);
    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({})).await;
        worker.expect_request("shutdown").await;
        // Never answers.
        worker
    });

    client.start().await.unwrap();
    client.stop().await;
    assert_eq!(client.state(), SessionState::Stopped);
    let _worker = worker_task.await.unwrap();
}

#[tokio::test]
async fn worker_exit_with_pending_requests_crashes_session() {
    let (mut client, mut worker) = connected_client();
    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({})).await;
        worker.expect_request("textDocument/hover").await;
        worker.expect_request("textDocument/definition").await;
        worker.close_output().await;
        worker
    });

    client.start().await.unwrap();
    let hover = client.begin_request("textDocument/hover", Some(json!({}))).unwrap();
    let definition = client
        .begin_request("textDocument/definition", Some(json!({})))
        .unwrap();

    assert!(matches!(hover.wait().await, Err(ClientError::SessionTerminated)));
    assert!(matches!(definition.wait().await, Err(ClientError::SessionTerminated)));
    assert_eq!(client.state(), SessionState::Crashed);
    let _worker = worker_task.await.unwrap();

    assert!(matches!(
        client.send_request("textDocument/hover", None).await,
        Err(ClientError::SessionNotActive(SessionState::Crashed))
    ));
    // Stopping a crashed session sends nothing and returns at once.
    client.stop().await;
    assert_eq!(client.state(), SessionState::Crashed);
}

#[tokio::test]
async fn rejected_handshake_crashes_session() {
    let (mut client, mut worker) = connected_client();
    let worker_task = tokio::spawn(async move {
        let init = worker.expect_request("initialize").await;
        worker
            .send(Message::Response(conduit_lsp::message::Response::err(
                init.id,
                conduit_lsp::message::ResponseError::new(-32603, "cannot start"),
            )))
            .await;
        worker
    });

    let err = client.start().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::HandshakeFailure(HandshakeError::Rejected(_))
    ));
    assert_eq!(client.state(), SessionState::Crashed);
    let _worker = worker_task.await.unwrap();
}

#[tokio::test]
async fn handshake_times_out() {
    let config = crate::common::config()
        .with_handshake_timeout(Duration::from_millis(50))
        .unwrap();
    let (channel, mut worker) = FakeWorker::pair();
    let mut client = LspClient::connect(config, channel);
    let worker_task = tokio::spawn(async move {
        worker.expect_request("initialize").await;
        worker
    });

    let err = client.start().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::HandshakeFailure(HandshakeError::Timeout(_))
    ));
    assert_eq!(client.state(), SessionState::Crashed);
    let _worker = worker_task.await.unwrap();
}
