//! Worker-originated traffic: notifications and requests.

use conduit_lsp::TraceLevel;
use conduit_lsp::message::{Message, Request, RequestId};
use conduit_lsp::protocol::{DiagnosticSeverity, PublishDiagnostics};
use serde_json::json;
use tokio::sync::mpsc;

use crate::common::{connected_client, file_uri};

#[tokio::test]
async fn diagnostics_reach_typed_handler() {
    let (mut client, mut worker) = connected_client();
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .on_notification::<PublishDiagnostics, _>(move |params| {
            let _ = tx.send(params);
        })
        .unwrap();

    let uri = file_uri("main.desc");
    let published = uri.to_string();
    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({})).await;
        worker
            .notify(
                "window/logMessage",
                json!({ "type": 3, "message": "indexing" }),
            )
            .await;
        worker
            .notify(
                "textDocument/publishDiagnostics",
                json!({
                    "uri": published,
                    "version": 1,
                    "diagnostics": [{
                        "range": {
                            "start": { "line": 2, "character": 4 },
                            "end": { "line": 2, "character": 9 }
                        },
                        "severity": 1,
                        "source": "desc",
                        "message": "unknown field"
                    }]
                }),
            )
            .await;
        worker
    });

    client.start().await.unwrap();
    let params = rx.recv().await.unwrap();
    assert_eq!(params.uri, uri.as_str());
    assert_eq!(params.version, Some(1));
    let diagnostic = &params.diagnostics[0];
    assert_eq!(diagnostic.severity(), DiagnosticSeverity::Error);
    let rendered = diagnostic.display_with_path(std::path::Path::new("main.desc"));
    assert_eq!(rendered, "main.desc:3:5: error: [desc] unknown field");
    let _worker = worker_task.await.unwrap();
}

#[tokio::test]
async fn every_handler_sees_notifications_in_arrival_order() {
    let (mut client, mut worker) = connected_client();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for handler in ["first", "second"] {
        let tx = tx.clone();
        client
            .on_raw_notification("custom/progress", move |params| {
                let _ = tx.send((handler, params["step"].as_u64().unwrap()));
            })
            .unwrap();
    }
    drop(tx);

    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({})).await;
        for step in 1..=2 {
            worker
                .notify("custom/progress", json!({ "step": step }))
                .await;
        }
        // Unregistered methods are ignored.
        worker.notify("custom/unheard", json!({})).await;
        worker
    });

    client.start().await.unwrap();
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(rx.recv().await.unwrap());
    }
    assert_eq!(
        seen,
        [("first", 1), ("second", 1), ("first", 2), ("second", 2)]
    );
    let _worker = worker_task.await.unwrap();
}

#[tokio::test]
async fn worker_requests_get_responses() {
    let (mut client, mut worker) = connected_client();
    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({})).await;
        worker
            .send(Message::Request(Request {
                id: RequestId::Number(100),
                method: "client/registerCapability".into(),
                params: Some(json!({ "registrations": [] })),
            }))
            .await;
        let first = worker.recv().await;
        worker
            .send(Message::Request(Request {
                id: RequestId::String("cfg".into()),
                method: "workspace/configuration".into(),
                params: Some(json!({ "items": [{ "section": "a" }, { "section": "b" }] })),
            }))
            .await;
        let second = worker.recv().await;
        (first, second)
    });

    client.start().await.unwrap();
    let (first, second) = worker_task.await.unwrap();
    match first {
        Message::Response(resp) => {
            assert_eq!(resp.id, Some(RequestId::Number(100)));
            assert_eq!(resp.outcome, Ok(serde_json::Value::Null));
        }
        other => panic!("unexpected {other:?}"),
    }
    match second {
        Message::Response(resp) => {
            assert_eq!(resp.id, Some(RequestId::String("cfg".into())));
            assert_eq!(resp.outcome, Ok(json!([null, null])));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn trace_level_has_no_protocol_effect() {
    let (mut client, mut worker) = connected_client();
    let worker_task = tokio::spawn(async move {
        worker.handshake(json!({})).await;
        let req = worker.expect_request("custom/echo").await;
        let params = req.params.clone().unwrap();
        worker.reply(req.id, params).await;
        worker
    });

    client.start().await.unwrap();
    client.set_trace_level(TraceLevel::Verbose);
    let echoed = client
        .send_request("custom/echo", Some(json!({ "k": "v" })))
        .await
        .unwrap();
    assert_eq!(echoed, json!({ "k": "v" }));
    client.set_trace_level(TraceLevel::Off);
    let _worker = worker_task.await.unwrap();
}
