//! Child-process lifecycle: spawn, frame messages over the pipes, forward
//! stderr, and shut down within the grace window.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use mcp_conduit::config::StdioConnection;
use mcp_conduit::process::StderrSink;
use mcp_conduit::protocol::{Message, Request, RequestId};
use mcp_conduit::transport::stdio::StdioClientTransport;
use mcp_conduit::transport::Transport;

#[tokio::test]
async fn messages_roundtrip_through_a_child_process() {
    // `cat` echoes each line straight back, so the client sees its own
    // request come around as inbound traffic.
    let connection = StdioConnection::new("cat");
    let transport = StdioClientTransport::spawn(&connection)
        .unwrap()
        .with_shutdown_grace(Duration::from_secs(2));

    let mut inbound = transport.receive();
    transport
        .send(Message::Request(Request::new(
            "ping",
            None,
            RequestId::Number(7),
        )))
        .await
        .unwrap();

    let echoed = tokio::time::timeout(Duration::from_secs(5), inbound.next())
        .await
        .expect("echo within deadline")
        .expect("stream open")
        .expect("valid message");
    match echoed {
        Message::Request(request) => {
            assert_eq!(request.method, "ping");
            assert_eq!(request.id, RequestId::Number(7));
        }
        other => panic!("expected request, got {other:?}"),
    }

    transport.close_gracefully().await.unwrap();
}

#[tokio::test]
async fn graceful_close_ends_the_inbound_stream() {
    let connection = StdioConnection::new("cat");
    let transport = StdioClientTransport::spawn(&connection)
        .unwrap()
        .with_shutdown_grace(Duration::from_secs(2));

    let mut inbound = transport.receive();
    transport.close_gracefully().await.unwrap();

    // With stdin closed, cat exits and the inbound stream drains to its end.
    let next = tokio::time::timeout(Duration::from_secs(5), inbound.next())
        .await
        .expect("stream ends promptly");
    assert!(next.is_none());
}

#[tokio::test]
async fn stderr_lines_reach_the_host_sink() {
    let (stderr_tx, mut stderr_rx) = mpsc::unbounded_channel::<String>();
    let sink: StderrSink = Arc::new(move |line| {
        let _ = stderr_tx.send(line.to_string());
    });

    let connection = StdioConnection::new("sh")
        .arg("-c")
        .arg("echo diagnostic-line 1>&2; cat");
    let transport = StdioClientTransport::spawn_with_stderr(&connection, Some(sink))
        .unwrap()
        .with_shutdown_grace(Duration::from_secs(2));

    let line = tokio::time::timeout(Duration::from_secs(5), stderr_rx.recv())
        .await
        .expect("stderr forwarded")
        .unwrap();
    assert_eq!(line, "diagnostic-line");

    transport.close().await.unwrap();
}
