//! Sessions over real worker processes.

use std::time::{Duration, Instant};

use conduit_lsp::{
    ClientConfig, ClientError, LaunchError, LspClient, SessionState, TransportConfig,
    WorkerConfig, WorkerState,
};

/// Answers `initialize` (always id 1 on a fresh client) without reading stdin.
const INITIALIZE_REPLY: &str =
    r#"printf 'Content-Length: 53\r\n\r\n{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}'"#;

fn sh(script: &str) -> WorkerConfig {
    WorkerConfig::new("sh").unwrap().with_args(["-c", script])
}

#[tokio::test]
async fn missing_shell_command_never_leaves_uninitialized() {
    let worker = WorkerConfig::new("conduit-suite-no-such-worker --stdio")
        .unwrap()
        .with_shell(true);
    let mut client = LspClient::new(ClientConfig::new(worker));
    let err = client.start().await.unwrap_err();
    assert!(
        matches!(err, ClientError::LaunchFailure(LaunchError::NotFound { .. })),
        "{err}"
    );
    assert_eq!(client.state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn unresponsive_worker_is_killed_within_one_grace_period() {
    let grace = Duration::from_millis(500);
    let script = format!("{INITIALIZE_REPLY}; exec sleep 30");
    let config = ClientConfig::new(sh(&script)).with_shutdown_grace(grace);
    let mut client = LspClient::new(config);

    client.start().await.unwrap();
    assert_eq!(client.state(), SessionState::Active);
    let worker = client.worker().unwrap().clone();
    assert_eq!(worker.state(), WorkerState::Running);

    let began = Instant::now();
    client.stop().await;
    let elapsed = began.elapsed();

    assert_eq!(client.state(), SessionState::Stopped);
    assert_eq!(worker.state(), WorkerState::Killed);
    assert!(elapsed >= grace, "stopped after {elapsed:?}");
    assert!(elapsed < grace * 2 - Duration::from_millis(100), "stopped after {elapsed:?}");
}

#[tokio::test]
async fn socket_worker_connects_back() {
    // `/dev/tcp` is a bash feature.
    let Ok(bash) = which::which("bash") else {
        return;
    };
    let script = format!(
        "port=${{1#--socket=}}; exec 3<>/dev/tcp/127.0.0.1/$port; {INITIALIZE_REPLY} >&3; exec cat <&3 >/dev/null"
    );
    let worker = WorkerConfig::new(bash.to_string_lossy())
        .unwrap()
        .with_args(["-c", script.as_str(), "worker"]);
    let config = ClientConfig::new(worker)
        .with_transport(TransportConfig::Socket { port: 0 })
        .with_shutdown_grace(Duration::from_millis(200));
    let mut client = LspClient::new(config);

    let caps = client.start().await.unwrap();
    assert!(!caps.completion);
    assert_eq!(client.state(), SessionState::Active);
    client.stop().await;
    assert_eq!(client.state(), SessionState::Stopped);
}

#[tokio::test]
async fn socket_worker_exiting_before_connect_fails_launch() {
    let config = ClientConfig::new(WorkerConfig::new("true").unwrap())
        .with_transport(TransportConfig::Socket { port: 0 });
    let mut client = LspClient::new(config);
    let err = client.start().await.unwrap_err();
    assert!(
        matches!(
            err,
            ClientError::LaunchFailure(LaunchError::ExitedBeforeConnect(WorkerState::Exited(
                Some(0)
            )))
        ),
        "{err}"
    );
    assert_eq!(client.state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn socket_worker_that_never_connects_times_out() {
    let timeout = Duration::from_millis(200);
    let worker = WorkerConfig::new("exec sleep 30; :")
        .unwrap()
        .with_shell(true);
    let config = ClientConfig::new(worker)
        .with_transport(TransportConfig::Socket { port: 0 })
        .with_handshake_timeout(timeout)
        .unwrap();
    let mut client = LspClient::new(config);
    let err = client.start().await.unwrap_err();
    assert!(
        matches!(err, ClientError::LaunchFailure(LaunchError::AcceptTimeout(t)) if t == timeout),
        "{err}"
    );
    assert_eq!(client.state(), SessionState::Uninitialized);
}
