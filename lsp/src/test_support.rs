//! In-memory worker for exercising a client without a process.
//!
//! Compiled for this crate's unit tests and, with the `test-support`
//! feature, for the workspace integration suite.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

use crate::codec::{FrameReader, FrameWriter};
use crate::message::{self, Message, Notification, Request, RequestId, Response};
use crate::transport::ByteChannel;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// The worker end of a duplex pipe speaking the framed protocol.
pub struct FakeWorker {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: Option<FrameWriter<WriteHalf<DuplexStream>>>,
}

impl FakeWorker {
    /// A connected pair: the client's channel and the worker end.
    #[must_use]
    pub fn pair() -> (ByteChannel, Self) {
        let (client, worker) = tokio::io::duplex(256 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (worker_read, worker_write) = tokio::io::split(worker);
        (
            ByteChannel::new(client_read, client_write),
            Self {
                reader: FrameReader::new(worker_read),
                writer: Some(FrameWriter::new(worker_write)),
            },
        )
    }

    /// Next message from the client, or `None` once it closed the channel.
    pub async fn try_recv(&mut self) -> Option<Message> {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.reader.read_frame())
            .await
            .expect("timed out waiting for client message")
            .ok()??;
        Some(message::decode(&frame).expect("client sent a malformed message"))
    }

    pub async fn recv(&mut self) -> Message {
        self.try_recv().await.expect("client closed the channel")
    }

    pub async fn expect_request(&mut self, method: &str) -> Request {
        match self.recv().await {
            Message::Request(req) if req.method == method => req,
            other => panic!("expected request {method}, got {other:?}"),
        }
    }

    pub async fn expect_notification(&mut self, method: &str) -> Notification {
        match self.recv().await {
            Message::Notification(note) if note.method == method => note,
            other => panic!("expected notification {method}, got {other:?}"),
        }
    }

    pub async fn send(&mut self, message: Message) {
        let body = message::encode(&message).expect("encodable message");
        let writer = self.writer.as_mut().expect("worker output already closed");
        writer.write_frame(&body).await.expect("client end is open");
    }

    pub async fn reply(&mut self, id: RequestId, result: Value) {
        self.send(Message::Response(Response::ok(id, result))).await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(Message::Notification(Notification::new(method, params)))
            .await;
    }

    /// Answer `initialize` with `capabilities` and consume `initialized`.
    pub async fn handshake(&mut self, capabilities: Value) {
        let init = self.expect_request("initialize").await;
        self.reply(
            init.id,
            json!({
                "capabilities": capabilities,
                "serverInfo": { "name": "fake-worker", "version": "0.1.0" }
            }),
        )
        .await;
        self.expect_notification("initialized").await;
    }

    /// Stop writing to the client, as a worker does when it exits.
    pub async fn close_output(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await.expect("clean shutdown");
        }
    }
}
