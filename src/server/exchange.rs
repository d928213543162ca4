//! Per-session surface for calling back into the connected client.
//!
//! Handlers receive a [`ServerExchange`] so they can reach the client that
//! issued the request: enumerate its roots, ask its model to sample, or push
//! log records at or above the level the client asked for.

use serde_json::json;
use std::sync::Arc;

use crate::error::Error;
use crate::protocol::methods;
use crate::session::McpSession;
use crate::types::{
    ClientCapabilities, CreateMessageRequest, CreateMessageResult, Implementation,
    ListRootsResult, LoggingMessageNotification,
};

/// One server-side session, viewed from inside a handler.
#[derive(Clone)]
pub struct ServerExchange {
    session: Arc<McpSession>,
}

impl ServerExchange {
    pub fn new(session: Arc<McpSession>) -> Self {
        Self { session }
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<McpSession> {
        &self.session
    }

    /// Identity the client sent in `initialize`.
    pub fn client_info(&self) -> Option<Implementation> {
        self.session.client_info()
    }

    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.session.client_capabilities()
    }

    /// Asks the client for its roots, serving repeated calls from the cache
    /// until a `notifications/roots/list_changed` invalidates it.
    pub async fn list_roots(&self) -> Result<ListRootsResult, Error> {
        if let Some(roots) = self.session.cached_roots() {
            return Ok(ListRootsResult { roots });
        }
        let result: ListRootsResult = self
            .session
            .send_request(methods::ROOTS_LIST, None)
            .await?;
        self.session.cache_roots(result.roots.clone());
        Ok(result)
    }

    /// Server-initiated sampling. The client must have declared the
    /// sampling capability during `initialize`.
    pub async fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> Result<CreateMessageResult, Error> {
        let capabilities = self.client_capabilities();
        if capabilities.and_then(|c| c.sampling).is_none() {
            return Err(Error::Other(
                "Client must be configured with sampling capabilities".into(),
            ));
        }
        self.session
            .send_request(
                methods::SAMPLING_CREATE_MESSAGE,
                Some(serde_json::to_value(request)?),
            )
            .await
    }

    /// Sends a log record to this client, dropping it when below the
    /// session's minimum level (set via `logging/setLevel`).
    pub async fn logging_notification(
        &self,
        notification: LoggingMessageNotification,
    ) -> Result<(), Error> {
        if notification.level < self.session.min_log_level() {
            return Ok(());
        }
        self.session
            .send_notification(
                methods::NOTIFICATION_MESSAGE,
                Some(serde_json::to_value(notification)?),
            )
            .await
    }

    /// Liveness probe of the connected client.
    pub async fn ping(&self) -> Result<(), Error> {
        let _: serde_json::Value = self.session.send_request(methods::PING, Some(json!({}))).await?;
        Ok(())
    }
}
