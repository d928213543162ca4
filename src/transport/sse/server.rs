//! Server half of the HTTP+SSE binding, built on axum.
//!
//! `GET <sse endpoint>` opens the long-lived event stream: the provider
//! assigns a fresh session id, runs the session factory, and immediately
//! emits the `endpoint` event telling the client where to POST.
//! `POST <message endpoint>` carries client-to-server JSON-RPC messages
//! correlated by the `MCP-Session-ID` header or the `sessionId` query
//! parameter (both are accepted).

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use super::client::SESSION_ID_HEADER;
use crate::error::Error;
use crate::protocol::Message;
use crate::session::McpSession;
use crate::transport::{MessageStream, ServerTransportProvider, SessionFactory, Transport};

/// Default SSE stream path, per the MCP transport specification.
pub const DEFAULT_SSE_ENDPOINT: &str = "/sse";

/// Grace window for flushing sessions during provider shutdown; a session
/// slower than this is force-closed.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_BUFFER_SIZE: usize = 64;
const MESSAGE_BUFFER_SIZE: usize = 100;

/// One frame on the SSE wire.
struct SseFrame {
    event: &'static str,
    id: u64,
    data: String,
}

/// Per-connection [`Transport`] bridging a session to its SSE stream.
pub struct SseSessionTransport {
    session_id: String,
    frames: Mutex<Option<mpsc::Sender<SseFrame>>>,
    inbound_tx: mpsc::Sender<Result<Message, Error>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Result<Message, Error>>>>,
    next_event_id: AtomicU64,
    closed: AtomicBool,
}

impl SseSessionTransport {
    fn new(session_id: String, frames: mpsc::Sender<SseFrame>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(MESSAGE_BUFFER_SIZE);
        Self {
            session_id,
            frames: Mutex::new(Some(frames)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            next_event_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    async fn send_frame(&self, event: &'static str, data: String) -> Result<(), Error> {
        let sender = self
            .frames
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Transport("SSE stream closed".into()))?;
        let frame = SseFrame {
            event,
            id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            data,
        };
        sender
            .send(frame)
            .await
            .map_err(|_| Error::Transport("SSE stream closed".into()))
    }

    /// Hands a POSTed message to the session's receive loop.
    async fn push_inbound(&self, message: Message) -> Result<(), Error> {
        self.inbound_tx
            .send(Ok(message))
            .await
            .map_err(|_| Error::Transport("session receive loop gone".into()))
    }

    fn drop_channels(&self) {
        self.frames.lock().unwrap().take();
        self.inbound_rx.lock().unwrap().take();
    }
}

#[async_trait]
impl Transport for SseSessionTransport {
    async fn send(&self, message: Message) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport("transport closed".into()));
        }
        let serialized = serde_json::to_string(&message)?;
        self.send_frame("message", serialized).await
    }

    fn receive(&self) -> MessageStream {
        let rx = self
            .inbound_rx
            .lock()
            .unwrap()
            .take()
            .expect("receive() may only be called once");
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    async fn close_gracefully(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::debug!("closing SSE session {}", self.session_id);
        if let Err(e) = self.send_frame("close", "Session closed".into()).await {
            log::debug!("could not send close event: {}", e);
        }
        self.drop_channels();
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        log::debug!("force closing SSE session {}", self.session_id);
        self.closed.store(true, Ordering::Release);
        self.drop_channels();
        Ok(())
    }
}

struct SessionEntry {
    session: Arc<McpSession>,
    transport: Arc<SseSessionTransport>,
}

/// HTTP+SSE [`ServerTransportProvider`]: one session per SSE connection.
pub struct SseServerTransportProvider {
    base_url: String,
    message_endpoint: String,
    sse_endpoint: String,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    factory: RwLock<Option<SessionFactory>>,
    closing: AtomicBool,
}

impl SseServerTransportProvider {
    /// Provider with the default `/sse` stream endpoint.
    pub fn new(message_endpoint: impl Into<String>) -> Self {
        Self::with_endpoints(message_endpoint, DEFAULT_SSE_ENDPOINT)
    }

    pub fn with_endpoints(
        message_endpoint: impl Into<String>,
        sse_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            base_url: String::new(),
            message_endpoint: message_endpoint.into(),
            sse_endpoint: sse_endpoint.into(),
            sessions: RwLock::new(HashMap::new()),
            factory: RwLock::new(None),
            closing: AtomicBool::new(false),
        }
    }

    /// Prefix prepended to the message endpoint in the `endpoint` event
    /// (useful behind a reverse proxy).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// The axum router exposing the SSE and message endpoints.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&self.sse_endpoint, get(handle_sse))
            .route(&self.message_endpoint, post(handle_message))
            .with_state(self.clone())
    }

    fn remove_session(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.write().unwrap().remove(session_id)
    }

    fn snapshot(&self) -> Vec<(String, Arc<McpSession>, Arc<SseSessionTransport>)> {
        self.sessions
            .read()
            .unwrap()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.session.clone(), entry.transport.clone()))
            .collect()
    }
}

#[async_trait]
impl ServerTransportProvider for SseServerTransportProvider {
    fn set_session_factory(&self, factory: SessionFactory) {
        *self.factory.write().unwrap() = Some(factory);
    }

    async fn notify_clients(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        let sessions = self.snapshot();
        if sessions.is_empty() {
            log::debug!("no active sessions to broadcast {} to", method);
            return Ok(());
        }
        log::debug!("broadcasting {} to {} sessions", method, sessions.len());

        let sends = sessions.iter().map(|(id, session, _)| {
            let params = params.clone();
            async move {
                if let Err(e) = session.send_notification(method, params).await {
                    log::error!("failed to send {} to session {}: {}", method, id, e);
                }
            }
        });
        futures::future::join_all(sends).await;
        Ok(())
    }

    async fn close_gracefully(&self) -> Result<(), Error> {
        self.closing.store(true, Ordering::Release);
        let sessions = self.snapshot();
        log::debug!(
            "initiating graceful shutdown with {} active sessions",
            sessions.len()
        );

        let closes = sessions.into_iter().map(|(id, session, transport)| async move {
            let graceful = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                let _ = transport.close_gracefully().await;
                session.close_gracefully().await
            })
            .await;
            if graceful.is_err() {
                log::warn!("session {} exceeded shutdown grace, force closing", id);
                let _ = session.close().await;
            }
        });
        futures::future::join_all(closes).await;
        self.sessions.write().unwrap().clear();
        log::debug!("graceful shutdown completed");
        Ok(())
    }

    fn close(&self) {
        self.closing.store(true, Ordering::Release);
        let sessions = std::mem::take(&mut *self.sessions.write().unwrap());
        for (_, entry) in sessions {
            tokio::spawn(async move {
                let _ = entry.session.close().await;
            });
        }
    }
}

/// Removes the session when the client's event stream is dropped.
struct DisconnectGuard {
    provider: Weak<SseServerTransportProvider>,
    session_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.upgrade() {
            if let Some(entry) = provider.remove_session(&self.session_id) {
                log::debug!("SSE connection closed for session {}", self.session_id);
                tokio::spawn(async move {
                    let _ = entry.session.close().await;
                });
            }
        }
    }
}

async fn handle_sse(State(provider): State<Arc<SseServerTransportProvider>>) -> Response {
    if provider.closing.load(Ordering::Acquire) {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }
    let factory = match provider.factory.read().unwrap().clone() {
        Some(factory) => factory,
        None => {
            log::error!("session factory not initialized");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Session factory not initialized",
            )
                .into_response();
        }
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    let (frame_tx, frame_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
    let transport = Arc::new(SseSessionTransport::new(session_id.clone(), frame_tx));
    let session = factory(transport.clone());
    provider.sessions.write().unwrap().insert(
        session_id.clone(),
        SessionEntry {
            session,
            transport: transport.clone(),
        },
    );
    log::debug!("new SSE connection with session id {}", session_id);

    let endpoint = format!(
        "{}{}?sessionId={}",
        provider.base_url, provider.message_endpoint, session_id
    );
    if let Err(e) = transport.send_frame("endpoint", endpoint).await {
        log::error!("failed to emit endpoint event: {}", e);
        provider.remove_session(&session_id);
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to open stream").into_response();
    }

    let guard = DisconnectGuard {
        provider: Arc::downgrade(&provider),
        session_id,
    };
    let stream = futures::stream::unfold(frame_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    })
    .map(move |frame| {
        let _keep_alive_guard = &guard;
        Ok::<Event, Infallible>(
            Event::default()
                .event(frame.event)
                .id(frame.id.to_string())
                .data(frame.data),
        )
    });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn handle_message(
    State(provider): State<Arc<SseServerTransportProvider>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| params.get("sessionId").cloned());
    let session_id = match session_id {
        Some(id) => id,
        None => {
            return (StatusCode::BAD_REQUEST, "Session ID is required").into_response();
        }
    };

    let transport = {
        let sessions = provider.sessions.read().unwrap();
        match sessions.get(&session_id) {
            Some(entry) => entry.transport.clone(),
            None => {
                log::warn!("message for unknown session id {}", session_id);
                return (StatusCode::NOT_FOUND, "Unknown session ID").into_response();
            }
        }
    };

    let message = match Message::from_str(&body) {
        Ok(message) => message,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Error deserializing message: {e}"),
            )
                .into_response();
        }
    };

    match transport.push_inbound(message).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error handling message: {e}"),
        )
            .into_response(),
    }
}
