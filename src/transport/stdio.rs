//! Stdio transport: line-delimited JSON-RPC over byte streams.
//!
//! Three pieces share the same framing (one serialized message per `\n`
//! terminated UTF-8 line):
//!
//! * [`StreamTransport`] — a [`Transport`] over any async reader/writer pair;
//!   the server side of the stdio binding is `StreamTransport` over the
//!   process's own stdin/stdout, and tests run it over in-memory pipes.
//! * [`StdioClientTransport`] — spawns the server as a child process and
//!   frames messages over its pipes, forwarding stderr to an optional sink.
//! * [`StdioServerTransportProvider`] — the single-connection server-side
//!   provider wrapping `StreamTransport`.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::StdioConnection;
use crate::error::Error;
use crate::process::{ProcessManager, StderrSink};
use crate::protocol::Message;
use crate::transport::{MessageStream, ServerTransportProvider, SessionFactory, Transport};

const MESSAGE_BUFFER_SIZE: usize = 100;

/// Inbound messages beyond this size are rejected with a parse error
/// instead of being decoded.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// How long a graceful stdio shutdown waits for the peer process to exit.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Line-delimited JSON-RPC transport over an arbitrary reader/writer pair.
pub struct StreamTransport {
    inbound: Mutex<Option<mpsc::Receiver<String>>>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    closed: AtomicBool,
}

impl StreamTransport {
    /// Wires a transport over the given handles, spawning the pump tasks.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(MESSAGE_BUFFER_SIZE);
        let (outbound_tx, outbound_rx) = mpsc::channel(MESSAGE_BUFFER_SIZE);
        tokio::spawn(crate::process::io::pump_inbound(reader, inbound_tx));
        tokio::spawn(crate::process::io::pump_outbound(writer, outbound_rx));
        Self::from_channels(inbound_rx, outbound_tx)
    }

    /// Wires a transport over pre-pumped line channels (used by the child
    /// process client, which owns its own pumps).
    pub(crate) fn from_channels(
        inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Self {
            inbound: Mutex::new(Some(inbound)),
            outbound: Mutex::new(Some(outbound)),
            closed: AtomicBool::new(false),
        }
    }

    /// A transport over this process's own stdin/stdout (the server side of
    /// the stdio binding).
    pub fn stdio() -> Self {
        Self::from_io(tokio::io::stdin(), tokio::io::stdout())
    }

    fn outbound_sender(&self) -> Result<mpsc::Sender<String>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport("transport closed".into()));
        }
        self.outbound
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Transport("transport closed".into()))
    }

    fn drop_outbound(&self) {
        // Dropping the sender lets the writer pump drain and exit.
        self.outbound.lock().unwrap().take();
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&self, message: Message) -> Result<(), Error> {
        let json = serde_json::to_string(&message)?;
        self.outbound_sender()?
            .send(json)
            .await
            .map_err(|_| Error::Transport("transport closed".into()))
    }

    fn receive(&self) -> MessageStream {
        let rx = self
            .inbound
            .lock()
            .unwrap()
            .take()
            .expect("receive() may only be called once");
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            let line = rx.recv().await?;
            if line.len() > MAX_MESSAGE_BYTES {
                let oversized = <serde_json::Error as serde::de::Error>::custom(format!(
                    "message of {} bytes exceeds the {} byte limit",
                    line.len(),
                    MAX_MESSAGE_BYTES
                ));
                return Some((Err(Error::Serialization(oversized)), rx));
            }
            Some((Message::from_str(&line), rx))
        }))
    }

    async fn close_gracefully(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        self.drop_outbound();
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        self.drop_outbound();
        self.inbound.lock().unwrap().take();
        Ok(())
    }
}

/// Client-side stdio transport: launches the configured server process and
/// frames JSON-RPC over its stdin/stdout.
pub struct StdioClientTransport {
    inner: StreamTransport,
    process: tokio::sync::Mutex<ProcessManager>,
    shutdown_grace: Duration,
}

impl StdioClientTransport {
    /// Spawns `connection.command` with its args and environment.
    pub fn spawn(connection: &StdioConnection) -> Result<Self, Error> {
        Self::spawn_with_stderr(connection, None)
    }

    /// Same as [`spawn`](Self::spawn), forwarding the child's stderr lines to
    /// `sink`.
    pub fn spawn_with_stderr(
        connection: &StdioConnection,
        stderr_sink: Option<StderrSink>,
    ) -> Result<Self, Error> {
        let mut command = Command::new(&connection.command);
        command.args(&connection.args);
        for (key, value) in &connection.env {
            command.env(key, value);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(MESSAGE_BUFFER_SIZE);
        let mut process = ProcessManager::new();
        let outbound_tx = process.start_process(command, inbound_tx, stderr_sink)?;

        Ok(Self {
            inner: StreamTransport::from_channels(inbound_rx, outbound_tx),
            process: tokio::sync::Mutex::new(process),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    /// Overrides the grace period used by [`close_gracefully`](Transport::close_gracefully).
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[async_trait]
impl Transport for StdioClientTransport {
    async fn send(&self, message: Message) -> Result<(), Error> {
        self.inner.send(message).await
    }

    fn receive(&self) -> MessageStream {
        self.inner.receive()
    }

    async fn close_gracefully(&self) -> Result<(), Error> {
        // Closing stdin signals the server to shut down; kill if it lingers.
        self.inner.close_gracefully().await?;
        self.process
            .lock()
            .await
            .shutdown_graceful(self.shutdown_grace)
            .await;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await?;
        self.process.lock().await.shutdown().await;
        Ok(())
    }
}

/// Server-side stdio provider: exactly one session over this process's own
/// stdin/stdout.
pub struct StdioServerTransportProvider {
    factory: RwLock<Option<SessionFactory>>,
    session: RwLock<Option<Arc<crate::session::McpSession>>>,
}

impl StdioServerTransportProvider {
    pub fn new() -> Self {
        Self {
            factory: RwLock::new(None),
            session: RwLock::new(None),
        }
    }

    /// Accepts the single stdio connection: builds a session over
    /// stdin/stdout through the installed factory and returns it.
    pub fn serve(&self) -> Result<Arc<crate::session::McpSession>, Error> {
        let transport: Arc<dyn Transport> = Arc::new(StreamTransport::stdio());
        self.serve_transport(transport)
    }

    /// Like [`serve`](Self::serve) with an explicit transport; this is how
    /// tests drive the provider over in-memory pipes.
    pub fn serve_transport(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<crate::session::McpSession>, Error> {
        let factory = self
            .factory
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Other("session factory not set".into()))?;
        let session = factory(transport);
        *self.session.write().unwrap() = Some(session.clone());
        Ok(session)
    }

    fn current_session(&self) -> Option<Arc<crate::session::McpSession>> {
        self.session.read().unwrap().clone()
    }
}

impl Default for StdioServerTransportProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerTransportProvider for StdioServerTransportProvider {
    fn set_session_factory(&self, factory: SessionFactory) {
        *self.factory.write().unwrap() = Some(factory);
    }

    async fn notify_clients(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        if let Some(session) = self.current_session() {
            if let Err(e) = session.send_notification(method, params).await {
                log::error!(
                    "failed to send notification to session {}: {}",
                    session.id(),
                    e
                );
            }
        }
        Ok(())
    }

    async fn close_gracefully(&self) -> Result<(), Error> {
        let session = self.session.write().unwrap().take();
        if let Some(session) = session {
            session.close_gracefully().await?;
        }
        Ok(())
    }

    fn close(&self) {
        if let Some(session) = self.session.write().unwrap().take() {
            tokio::spawn(async move {
                let _ = session.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, RequestId};
    use futures::StreamExt;

    #[tokio::test]
    async fn messages_roundtrip_over_duplex_pipes() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let client = StreamTransport::from_io(client_read, client_write);
        let server = StreamTransport::from_io(server_read, server_write);

        let mut inbound = server.receive();
        client
            .send(Message::Request(Request::new(
                "ping",
                None,
                RequestId::Number(1),
            )))
            .await
            .unwrap();

        match inbound.next().await.unwrap().unwrap() {
            Message::Request(r) => assert_eq!(r.method, "ping"),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let client = StreamTransport::from_io(client_read, client_write);
        let server = StreamTransport::from_io(server_read, server_write);

        for i in 0..10 {
            client
                .send(Message::Request(Request::new(
                    "ping",
                    None,
                    RequestId::Number(i),
                )))
                .await
                .unwrap();
        }

        let mut inbound = server.receive();
        for i in 0..10 {
            match inbound.next().await.unwrap().unwrap() {
                Message::Request(r) => assert_eq!(r.id, RequestId::Number(i)),
                other => panic!("expected request, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn malformed_line_yields_error_item_then_stream_continues() {
        let (mut client_io, server_io) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_io);
        let server = StreamTransport::from_io(server_read, server_write);

        use tokio::io::AsyncWriteExt;
        client_io.write_all(b"this is not json\n").await.unwrap();
        client_io
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .unwrap();

        let mut inbound = server.receive();
        assert!(inbound.next().await.unwrap().is_err());
        assert!(inbound.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let client = StreamTransport::from_io(client_read, client_write);

        client.close().await.unwrap();
        let err = client
            .send(Message::Request(Request::new(
                "ping",
                None,
                RequestId::Number(1),
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn peer_eof_ends_inbound_stream() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_io);
        let server = StreamTransport::from_io(server_read, server_write);

        drop(client_io);
        let mut inbound = server.receive();
        assert!(inbound.next().await.is_none());
    }
}
