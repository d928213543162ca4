//! The session core: a symmetric JSON-RPC engine over one transport.
//!
//! A session multiplexes concurrent in-flight requests over a single
//! [`Transport`], correlating responses by id, dispatching inbound requests
//! and notifications to registered handlers, and enforcing the MCP lifecycle
//! (`Uninitialized` → `Initialized` → `Closed`). Handlers run on spawned
//! tasks so the receive loop is never blocked by user code.

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, ErrorCode};
use crate::protocol::{methods, Message, Notification, Request, RequestId, Response, ResponseError};
use crate::transport::Transport;
use crate::types::{ClientCapabilities, Implementation, LoggingLevel, Root};

/// Default deadline for outbound requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Boxed future returned by request and notification handlers.
pub type HandlerFuture<T> = BoxFuture<'static, Result<T, Error>>;

/// Handles an inbound request; the returned value becomes the JSON-RPC
/// `result`. The session is passed in so handlers can call back to the peer.
pub type RequestHandler =
    Arc<dyn Fn(Arc<McpSession>, Option<Value>) -> HandlerFuture<Value> + Send + Sync>;

/// Handles an inbound notification. Errors are logged, never propagated.
pub type NotificationHandler =
    Arc<dyn Fn(Arc<McpSession>, Option<Value>) -> HandlerFuture<()> + Send + Sync>;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Uninitialized = 0,
    Initialized = 1,
    Closed = 2,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Uninitialized,
            1 => Phase::Initialized,
            _ => Phase::Closed,
        }
    }
}

/// Per-connection protocol state: pending requests, dispatch tables, peer
/// identity, and lifecycle phase.
pub struct McpSession {
    id: String,
    request_timeout: Duration,
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Response>>>,
    request_handlers: HashMap<String, RequestHandler>,
    notification_handlers: HashMap<String, NotificationHandler>,
    id_prefix: String,
    counter: AtomicI64,
    phase: AtomicU8,
    closing: AtomicBool,
    init_seen: AtomicBool,
    client_info: RwLock<Option<Implementation>>,
    client_capabilities: RwLock<Option<ClientCapabilities>>,
    min_log_level: RwLock<LoggingLevel>,
    roots_cache: RwLock<Option<Vec<Root>>>,
}

impl McpSession {
    /// Creates a session. Server-side sessions start `Uninitialized` (the
    /// peer must run the initialize handshake); client-side sessions start
    /// `Initialized` since the client gates itself on its own handshake.
    pub fn new(
        id: impl Into<String>,
        request_timeout: Duration,
        transport: Arc<dyn Transport>,
        initial_phase: Phase,
        request_handlers: HashMap<String, RequestHandler>,
        notification_handlers: HashMap<String, NotificationHandler>,
    ) -> Arc<Self> {
        let prefix = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Arc::new(Self {
            id: id.into(),
            request_timeout,
            transport,
            pending: Mutex::new(HashMap::new()),
            request_handlers,
            notification_handlers,
            id_prefix: prefix,
            counter: AtomicI64::new(0),
            phase: AtomicU8::new(initial_phase as u8),
            closing: AtomicBool::new(false),
            init_seen: AtomicBool::new(false),
            client_info: RwLock::new(None),
            client_capabilities: RwLock::new(None),
            min_log_level: RwLock::new(LoggingLevel::Debug),
            roots_cache: RwLock::new(None),
        })
    }

    /// The session id (fresh per connection).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Returns true exactly once; the server's initialize handler uses this
    /// to accept a single `initialize` request per session.
    pub fn try_begin_initialize(&self) -> bool {
        !self.init_seen.swap(true, Ordering::AcqRel)
    }

    /// Records the peer identity learned from `initialize`.
    pub fn set_client_info(&self, info: Implementation, capabilities: ClientCapabilities) {
        *self.client_info.write().unwrap() = Some(info);
        *self.client_capabilities.write().unwrap() = Some(capabilities);
    }

    pub fn client_info(&self) -> Option<Implementation> {
        self.client_info.read().unwrap().clone()
    }

    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.client_capabilities.read().unwrap().clone()
    }

    /// Minimum severity the peer asked for via `logging/setLevel`.
    pub fn min_log_level(&self) -> LoggingLevel {
        *self.min_log_level.read().unwrap()
    }

    pub fn set_min_log_level(&self, level: LoggingLevel) {
        *self.min_log_level.write().unwrap() = level;
    }

    /// Cached copy of the peer's declared roots, refreshed on
    /// `notifications/roots/list_changed`.
    pub fn cached_roots(&self) -> Option<Vec<Root>> {
        self.roots_cache.read().unwrap().clone()
    }

    pub fn cache_roots(&self, roots: Vec<Root>) {
        *self.roots_cache.write().unwrap() = Some(roots);
    }

    pub fn invalidate_roots_cache(&self) {
        *self.roots_cache.write().unwrap() = None;
    }

    fn generate_request_id(&self) -> RequestId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        RequestId::String(format!("{}-{}", self.id_prefix, n))
    }

    /// Starts the receive loop, delivering inbound messages in receive order
    /// and spawning handler work off the loop.
    pub fn start(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move {
            let mut stream = session.transport.receive();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(message) => session.dispatch(message),
                    Err(Error::Serialization(e)) => {
                        log::warn!("session {}: unparseable inbound message: {}", session.id, e);
                        let response = Response::error(
                            RequestId::Null,
                            ResponseError::new(ErrorCode::ParseError.into(), e.to_string()),
                        );
                        if let Err(send_err) =
                            session.transport.send(Message::Response(response)).await
                        {
                            log::debug!(
                                "session {}: could not send parse error: {}",
                                session.id,
                                send_err
                            );
                        }
                    }
                    Err(e) => {
                        log::error!("session {}: transport fault: {}", session.id, e);
                        break;
                    }
                }
            }
            log::debug!("session {}: inbound stream ended", session.id);
            session.set_phase(Phase::Closed);
            session.fail_pending();
        });
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::Response(response) => self.handle_response(response),
            Message::Request(request) => {
                let session = self.clone();
                tokio::spawn(async move { session.handle_request(request).await });
            }
            Message::Notification(notification) => {
                let session = self.clone();
                tokio::spawn(async move { session.handle_notification(notification).await });
            }
        }
    }

    fn handle_response(&self, response: Response) {
        let slot = self.pending.lock().unwrap().remove(&response.id);
        match slot {
            Some(sender) => {
                // Receiver may have timed out between removal and delivery.
                let _ = sender.send(response);
            }
            None => {
                log::warn!(
                    "session {}: dropping response for unknown id {}",
                    self.id,
                    response.id
                );
            }
        }
    }

    async fn handle_request(self: Arc<Self>, request: Request) {
        let response = self.clone().request_response(request).await;
        if let Err(e) = self.transport.send(Message::Response(response)).await {
            log::error!("session {}: failed to send response: {}", self.id, e);
        }
    }

    async fn request_response(self: Arc<Self>, request: Request) -> Response {
        if self.phase() == Phase::Uninitialized
            && request.method != methods::INITIALIZE
            && request.method != methods::PING
        {
            return Response::error(
                request.id,
                ResponseError::new(
                    ErrorCode::InvalidRequest.into(),
                    format!("Method {} attempted before initialization", request.method),
                ),
            );
        }

        let handler = match self.request_handlers.get(&request.method) {
            Some(handler) => handler.clone(),
            None => {
                return Response::error(request.id, method_not_found(&request.method));
            }
        };

        match handler(self.clone(), request.params).await {
            Ok(result) => Response::success(request.id, Some(result)),
            Err(err) => {
                log::debug!(
                    "session {}: handler for {} failed: {}",
                    self.id,
                    request.method,
                    err
                );
                Response::error(request.id, ResponseError::from(err))
            }
        }
    }

    async fn handle_notification(self: Arc<Self>, notification: Notification) {
        if notification.method == methods::NOTIFICATION_INITIALIZED
            && self.phase() == Phase::Uninitialized
        {
            log::debug!("session {}: initialized", self.id);
            self.set_phase(Phase::Initialized);
        }

        match self.notification_handlers.get(&notification.method) {
            Some(handler) => {
                if let Err(e) = handler(self.clone(), notification.params).await {
                    log::error!(
                        "session {}: error handling notification {}: {}",
                        self.id,
                        notification.method,
                        e
                    );
                }
            }
            None => {
                log::debug!(
                    "session {}: no handler for notification {}",
                    self.id,
                    notification.method
                );
            }
        }
    }

    /// Sends a request and awaits the correlated response, decoded to `T`.
    ///
    /// Exactly one terminal outcome is observed: the decoded result, a
    /// protocol error from the peer, [`Error::Timeout`] after the session's
    /// request timeout (late responses are then dropped with a warning), or
    /// [`Error::SessionClosed`].
    pub async fn send_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, Error> {
        if self.closing.load(Ordering::Acquire) || self.phase() == Phase::Closed {
            return Err(Error::SessionClosed);
        }

        let id = self.generate_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        let request = Request::new(method, params, id.clone());
        if let Err(e) = self.transport.send(Message::Request(request)).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(Error::SessionClosed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(Error::Timeout(self.request_timeout));
            }
        };

        if let Some(error) = response.error {
            return Err(Error::from_response_error(error));
        }
        Ok(serde_json::from_value(
            response.result.unwrap_or(Value::Null),
        )?)
    }

    /// Sends a notification; no correlation state is kept.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        if self.phase() == Phase::Closed {
            return Err(Error::SessionClosed);
        }
        self.transport
            .send(Message::Notification(Notification::new(method, params)))
            .await
    }

    /// Number of outstanding outbound requests.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn fail_pending(&self) {
        // Dropping the senders completes every waiter with SessionClosed.
        self.pending.lock().unwrap().clear();
    }

    /// Stops accepting new outbound requests, waits for in-flight ones to
    /// complete or time out (bounded by the request timeout), then closes
    /// the transport.
    pub async fn close_gracefully(&self) -> Result<(), Error> {
        self.closing.store(true, Ordering::Release);
        let deadline = Instant::now() + self.request_timeout;
        while Instant::now() < deadline {
            if self.pending.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.set_phase(Phase::Closed);
        self.fail_pending();
        self.transport.close_gracefully().await
    }

    /// Cancels all pending requests with a session-closed error and
    /// terminates the transport.
    pub async fn close(&self) -> Result<(), Error> {
        self.closing.store(true, Ordering::Release);
        self.set_phase(Phase::Closed);
        self.fail_pending();
        self.transport.close().await
    }
}

/// Builds the METHOD_NOT_FOUND error for a method, attaching the
/// capability hint for `roots/list` (the server asked a client that never
/// declared the roots capability).
fn method_not_found(method: &str) -> ResponseError {
    if method == methods::ROOTS_LIST {
        ResponseError::with_data(
            ErrorCode::MethodNotFound.into(),
            "Roots not supported",
            serde_json::json!({"reason": "Client does not have roots capability"}),
        )
    } else {
        ResponseError::new(
            ErrorCode::MethodNotFound.into(),
            format!("Method not found: {}", method),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageStream;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Channel-backed transport: outbound messages land on `sent_rx`,
    /// inbound ones are pushed through `inbound_tx`.
    struct ChannelTransport {
        inbound: Mutex<Option<mpsc::UnboundedReceiver<Result<Message, Error>>>>,
        sent: mpsc::UnboundedSender<Message>,
    }

    fn channel_transport() -> (
        Arc<ChannelTransport>,
        mpsc::UnboundedSender<Result<Message, Error>>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ChannelTransport {
            inbound: Mutex::new(Some(inbound_rx)),
            sent: sent_tx,
        });
        (transport, inbound_tx, sent_rx)
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&self, message: Message) -> Result<(), Error> {
            self.sent
                .send(message)
                .map_err(|_| Error::Transport("peer gone".into()))
        }

        fn receive(&self) -> MessageStream {
            let rx = self.inbound.lock().unwrap().take().expect("receive() called twice");
            Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }))
        }

        async fn close_gracefully(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn close(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn ping_handler() -> RequestHandler {
        Arc::new(|_session, _params| -> HandlerFuture<Value> {
            Box::pin(async { Ok(json!({})) })
        })
    }

    fn session_with(
        timeout: Duration,
        phase: Phase,
        request_handlers: HashMap<String, RequestHandler>,
    ) -> (
        Arc<McpSession>,
        mpsc::UnboundedSender<Result<Message, Error>>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (transport, inbound, sent) = channel_transport();
        let session = McpSession::new(
            "test-session",
            timeout,
            transport,
            phase,
            request_handlers,
            HashMap::new(),
        );
        session.start();
        (session, inbound, sent)
    }

    #[tokio::test]
    async fn request_resolves_with_correlated_response() {
        let (session, inbound, mut sent) =
            session_with(Duration::from_secs(5), Phase::Initialized, HashMap::new());

        let task = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .send_request::<Value>("tools/list", None)
                    .await
            })
        };

        let outbound = sent.recv().await.unwrap();
        let id = match outbound {
            Message::Request(r) => {
                assert_eq!(r.method, "tools/list");
                r.id
            }
            other => panic!("expected request, got {other:?}"),
        };
        inbound
            .send(Ok(Message::Response(Response::success(
                id,
                Some(json!({"tools": []})),
            ))))
            .unwrap();

        let result = task.await.unwrap().unwrap();
        assert_eq!(result, json!({"tools": []}));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn request_times_out_and_late_response_is_dropped() {
        let (session, inbound, mut sent) =
            session_with(Duration::from_millis(50), Phase::Initialized, HashMap::new());

        let err = session
            .send_request::<Value>("tools/list", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(session.pending_count(), 0);

        // A late response must be discarded without disturbing the session.
        let id = match sent.recv().await.unwrap() {
            Message::Request(r) => r.id,
            other => panic!("expected request, got {other:?}"),
        };
        inbound
            .send(Ok(Message::Response(Response::success(id, Some(json!({}))))))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn peer_error_propagates_to_caller() {
        let (session, inbound, mut sent) =
            session_with(Duration::from_secs(5), Phase::Initialized, HashMap::new());

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.send_request::<Value>("prompts/get", None).await })
        };
        let id = match sent.recv().await.unwrap() {
            Message::Request(r) => r.id,
            other => panic!("expected request, got {other:?}"),
        };
        inbound
            .send(Ok(Message::Response(Response::error(
                id,
                ResponseError::new(-32602, "invalid params"),
            ))))
            .unwrap();

        match task.await.unwrap().unwrap_err() {
            Error::Protocol { code, message, .. } => {
                assert_eq!(code, ErrorCode::InvalidParams);
                assert_eq!(message, "invalid params");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_method_gets_method_not_found() {
        let (_session, inbound, mut sent) =
            session_with(Duration::from_secs(5), Phase::Initialized, HashMap::new());

        inbound
            .send(Ok(Message::Request(Request::new(
                "no/such",
                None,
                RequestId::Number(9),
            ))))
            .unwrap();

        match sent.recv().await.unwrap() {
            Message::Response(r) => {
                assert_eq!(r.id, RequestId::Number(9));
                let error = r.error.unwrap();
                assert_eq!(error.code, -32601);
                assert!(error.data.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn roots_list_carries_capability_reason() {
        let (_session, inbound, mut sent) =
            session_with(Duration::from_secs(5), Phase::Initialized, HashMap::new());

        inbound
            .send(Ok(Message::Request(Request::new(
                methods::ROOTS_LIST,
                None,
                RequestId::Number(1),
            ))))
            .unwrap();

        match sent.recv().await.unwrap() {
            Message::Response(r) => {
                let error = r.error.unwrap();
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "Roots not supported");
                assert_eq!(
                    error.data.unwrap()["reason"],
                    "Client does not have roots capability"
                );
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn feature_methods_rejected_before_initialization() {
        let mut handlers = HashMap::new();
        handlers.insert("tools/list".to_string(), ping_handler());
        let (_session, inbound, mut sent) =
            session_with(Duration::from_secs(5), Phase::Uninitialized, handlers);

        inbound
            .send(Ok(Message::Request(Request::new(
                "tools/list",
                None,
                RequestId::Number(2),
            ))))
            .unwrap();

        match sent.recv().await.unwrap() {
            Message::Response(r) => {
                assert_eq!(r.error.unwrap().code, -32600);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_is_always_permitted() {
        let mut handlers = HashMap::new();
        handlers.insert(methods::PING.to_string(), ping_handler());
        let (_session, inbound, mut sent) =
            session_with(Duration::from_secs(5), Phase::Uninitialized, handlers);

        inbound
            .send(Ok(Message::Request(Request::new(
                methods::PING,
                None,
                RequestId::Number(3),
            ))))
            .unwrap();

        match sent.recv().await.unwrap() {
            Message::Response(r) => {
                assert!(r.error.is_none());
                assert_eq!(r.result.unwrap(), json!({}));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn initialized_notification_advances_phase_without_response() {
        let (session, inbound, mut sent) =
            session_with(Duration::from_secs(5), Phase::Uninitialized, HashMap::new());

        inbound
            .send(Ok(Message::Notification(Notification::new(
                methods::NOTIFICATION_INITIALIZED,
                None,
            ))))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.phase(), Phase::Initialized);

        // Notifications never cause a response.
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn handler_failure_becomes_internal_error() {
        let mut handlers = HashMap::new();
        let explode: RequestHandler = Arc::new(|_s, _p| -> HandlerFuture<Value> {
            Box::pin(async { Err(Error::Other("kaboom".into())) })
        });
        handlers.insert("explode".to_string(), explode);
        let (_session, inbound, mut sent) =
            session_with(Duration::from_secs(5), Phase::Initialized, handlers);

        inbound
            .send(Ok(Message::Request(Request::new(
                "explode",
                None,
                RequestId::Number(4),
            ))))
            .unwrap();

        match sent.recv().await.unwrap() {
            Message::Response(r) => {
                let error = r.error.unwrap();
                assert_eq!(error.code, -32603);
                assert_eq!(error.message, "kaboom");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_close_fails_outstanding_requests() {
        let (session, inbound, mut sent) =
            session_with(Duration::from_secs(30), Phase::Initialized, HashMap::new());

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.send_request::<Value>("tools/list", None).await })
        };
        // Wait until the request is on the wire, then drop the inbound side.
        let _ = sent.recv().await.unwrap();
        drop(inbound);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
        assert_eq!(session.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn unparseable_inbound_produces_parse_error_response() {
        let (_session, inbound, mut sent) =
            session_with(Duration::from_secs(5), Phase::Initialized, HashMap::new());

        let bad = serde_json::from_str::<Value>("{]").unwrap_err();
        inbound.send(Err(Error::Serialization(bad))).unwrap();

        match sent.recv().await.unwrap() {
            Message::Response(r) => {
                assert_eq!(r.id, RequestId::Null);
                assert_eq!(r.error.unwrap().code, -32700);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_session_refuses_new_requests() {
        let (session, _inbound, _sent) =
            session_with(Duration::from_secs(5), Phase::Initialized, HashMap::new());
        session.close().await.unwrap();
        let err = session
            .send_request::<Value>("tools/list", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
    }
}
