//! Transport abstractions.
//!
//! A [`Transport`] is a bidirectional, ordered channel of framed JSON-RPC
//! [`Message`]s. Client-side transports are constructed directly; server-side
//! bindings expose a [`ServerTransportProvider`] that manufactures one session
//! per accepted connection through a [`SessionFactory`].

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Error;
use crate::protocol::Message;
use crate::session::McpSession;

pub mod sse;
pub mod stdio;

/// Stream of inbound messages, delivered in receive order.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, Error>> + Send>>;

/// Bidirectional message channel carrying framed JSON-RPC messages.
///
/// Ordering: messages passed to [`send`](Transport::send) reach the peer in
/// call order; the stream returned by [`receive`](Transport::receive) yields
/// inbound messages in receive order. Completion of `send` means "handed to
/// the wire", not "acknowledged by the peer".
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueues an outbound message.
    async fn send(&self, message: Message) -> Result<(), Error>;

    /// Returns the inbound message stream.
    ///
    /// The stream ends when the underlying connection closes; transport
    /// faults surface as `Err` items. May only be consumed once per
    /// transport.
    fn receive(&self) -> MessageStream;

    /// Stops accepting new sends, flushes pending ones, then terminates.
    async fn close_gracefully(&self) -> Result<(), Error>;

    /// Immediate termination.
    async fn close(&self) -> Result<(), Error>;
}

/// Builds (and starts) a session for a freshly accepted server-side
/// connection.
pub type SessionFactory = Arc<dyn Fn(Arc<dyn Transport>) -> Arc<McpSession> + Send + Sync>;

/// Server-side half of a transport binding: accepts connections, creates one
/// session per connection, and fans notifications out to all of them.
#[async_trait]
pub trait ServerTransportProvider: Send + Sync {
    /// Installs the factory invoked for every accepted connection. Must be
    /// called before the provider starts accepting.
    fn set_session_factory(&self, factory: SessionFactory);

    /// Sends a notification to every live session, tolerating per-session
    /// failures (they are logged, not propagated).
    async fn notify_clients(&self, method: &str, params: Option<Value>) -> Result<(), Error>;

    /// Refuses new connections, then closes every live session gracefully.
    async fn close_gracefully(&self) -> Result<(), Error>;

    /// Immediate shutdown of all sessions.
    fn close(&self);
}
