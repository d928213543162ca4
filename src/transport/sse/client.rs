//! Client half of the HTTP+SSE binding.
//!
//! Opens the long-lived SSE stream, waits for the server's `endpoint` event
//! to learn where to POST, then sends every outbound message as an HTTP POST
//! while inbound messages arrive as `message` events on the stream. Stream
//! loss surfaces as transport closure; reconnection is left to higher layers
//! (a reconnect means a brand-new session).

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::event::SseParser;
use crate::config::SseConnection;
use crate::error::Error;
use crate::protocol::Message;
use crate::transport::{MessageStream, Transport};

/// Header the server uses to correlate POSTs with an SSE session.
pub const SESSION_ID_HEADER: &str = "MCP-Session-ID";

/// Default SSE stream path.
pub const DEFAULT_SSE_ENDPOINT: &str = "/sse";

/// How long to wait for the server's `endpoint` event before giving up.
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MESSAGE_BUFFER_SIZE: usize = 100;
const ACCEPTED_STATUSES: &[u16] = &[200, 201, 202, 206];

/// Builder for [`SseClientTransport`].
pub struct SseClientTransportBuilder {
    url: String,
    sse_endpoint: String,
    headers: HeaderMap,
    endpoint_timeout: Duration,
}

impl SseClientTransportBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sse_endpoint: DEFAULT_SSE_ENDPOINT.to_string(),
            headers: HeaderMap::new(),
            endpoint_timeout: DEFAULT_ENDPOINT_TIMEOUT,
        }
    }

    /// Builder seeded from a configured connection entry.
    pub fn from_connection(connection: &SseConnection) -> Self {
        let mut builder = Self::new(connection.url.clone());
        if let Some(endpoint) = &connection.sse_endpoint {
            builder.sse_endpoint = endpoint.clone();
        }
        builder
    }

    /// Adds a header sent on the SSE GET and on every message POST.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, Error> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Other(format!("invalid header name: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Other(format!("invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn endpoint_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint_timeout = timeout;
        self
    }

    /// Opens the SSE stream and completes once the `endpoint` event arrives.
    pub async fn connect(self) -> Result<SseClientTransport, Error> {
        SseClientTransport::connect(self).await
    }
}

/// SSE-backed [`Transport`]: POST out, event-stream in.
pub struct SseClientTransport {
    http: reqwest::Client,
    headers: HeaderMap,
    message_url: String,
    session_id: RwLock<Option<String>>,
    inbound: Mutex<Option<mpsc::Receiver<Result<Message, Error>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SseClientTransport {
    /// Starts building a transport for `url` (scheme + authority, no path).
    pub fn builder(url: impl Into<String>) -> SseClientTransportBuilder {
        SseClientTransportBuilder::new(url)
    }

    async fn connect(builder: SseClientTransportBuilder) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;

        let sse_url = join_url(&builder.url, &builder.sse_endpoint);
        let response = http
            .get(&sse_url)
            .headers(builder.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::Transport(format!("SSE connect failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "SSE connect failed with status {}",
                response.status()
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(MESSAGE_BUFFER_SIZE);
        let reader = tokio::spawn(read_events(response, endpoint_tx, inbound_tx));

        let endpoint =
            match tokio::time::timeout(builder.endpoint_timeout, endpoint_rx).await {
                Ok(Ok(endpoint)) => endpoint,
                Ok(Err(_)) => {
                    reader.abort();
                    return Err(Error::Transport(
                        "SSE stream closed before the endpoint event".into(),
                    ));
                }
                Err(_) => {
                    reader.abort();
                    return Err(Error::Transport(format!(
                        "no endpoint event within {:?}",
                        builder.endpoint_timeout
                    )));
                }
            };

        let message_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.clone()
        } else {
            join_url(&builder.url, &endpoint)
        };
        let session_id = extract_session_id(&endpoint);
        log::debug!(
            "SSE transport connected, message endpoint {} (session {:?})",
            message_url,
            session_id
        );

        Ok(Self {
            http,
            headers: builder.headers,
            message_url,
            session_id: RwLock::new(session_id),
            inbound: Mutex::new(Some(inbound_rx)),
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        })
    }

    /// The session id learned from the `endpoint` event, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().unwrap().clone()
    }

    fn abort_reader(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for SseClientTransport {
    async fn send(&self, message: Message) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport("transport closed".into()));
        }
        let body = serde_json::to_string(&message)?;
        let mut request = self
            .http
            .post(&self.message_url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json");
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("message POST failed: {e}")))?;

        let status = response.status().as_u16();
        if ACCEPTED_STATUSES.contains(&status) {
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "message POST rejected with status {status}"
            )))
        }
    }

    fn receive(&self) -> MessageStream {
        let rx = self
            .inbound
            .lock()
            .unwrap()
            .take()
            .expect("receive() may only be called once");
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    async fn close_gracefully(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        self.abort_reader();
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        self.abort_reader();
        self.inbound.lock().unwrap().take();
        Ok(())
    }
}

/// Drains the SSE body: routes the first `endpoint` event to the connector,
/// `message` events into the inbound channel, and stops on `close`.
async fn read_events(
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    inbound_tx: mpsc::Sender<Result<Message, Error>>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("SSE stream lost: {}", e);
                let _ = inbound_tx
                    .send(Err(Error::Transport(format!("SSE stream lost: {e}"))))
                    .await;
                return;
            }
        };

        for event in parser.push(&String::from_utf8_lossy(&chunk)) {
            match event.event.as_str() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data);
                    }
                }
                "message" => {
                    let item = Message::from_str(&event.data);
                    if inbound_tx.send(item).await.is_err() {
                        return;
                    }
                }
                "close" => {
                    log::debug!("server sent close event");
                    return;
                }
                other => {
                    log::debug!("ignoring SSE event type {}", other);
                }
            }
        }
    }
    log::debug!("SSE stream ended");
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

fn extract_session_id(endpoint: &str) -> Option<String> {
    let query = endpoint.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "sessionId").then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_read_from_endpoint_query() {
        assert_eq!(
            extract_session_id("/mcp/message?sessionId=abc-123"),
            Some("abc-123".to_string())
        );
        assert_eq!(
            extract_session_id("http://h:1/m?x=1&sessionId=s9"),
            Some("s9".to_string())
        );
        assert_eq!(extract_session_id("/mcp/message"), None);
    }

    #[test]
    fn urls_join_without_double_slash() {
        assert_eq!(join_url("http://h:1/", "/sse"), "http://h:1/sse");
        assert_eq!(join_url("http://h:1", "/sse"), "http://h:1/sse");
    }
}
