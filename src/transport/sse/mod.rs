//! HTTP+SSE transport binding.
//!
//! Server-push travels over a long-lived `text/event-stream` response;
//! client-to-server messages are HTTP POSTs correlated by session id.
//! Reconnection is deliberately not provided: a lost stream surfaces as a
//! transport error and a reconnect establishes a brand-new session.

pub mod client;
pub mod event;
pub mod server;

pub use client::{SseClientTransport, SseClientTransportBuilder, SESSION_ID_HEADER};
pub use event::{SseEvent, SseParser};
pub use server::SseServerTransportProvider;
