//! Client side of the protocol: the initialize handshake, typed wrappers for
//! every client-callable method, the client's root registry, and the handler
//! seams for server-initiated `sampling/createMessage` and `roots/list`.
//!
//! Handlers for server-initiated calls are only installed for capabilities
//! the client declares; a server calling an undeclared capability gets
//! `METHOD_NOT_FOUND` from the session layer.

use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::Error;
use crate::protocol::{methods, LATEST_PROTOCOL_VERSION};
use crate::session::{
    HandlerFuture, McpSession, NotificationHandler, Phase, RequestHandler,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::transport::Transport;
use crate::types::*;

pub mod blocking;

pub use blocking::McpSyncClient;

/// Answers server-initiated `sampling/createMessage` requests.
pub type SamplingHandler =
    Arc<dyn Fn(CreateMessageRequest) -> HandlerFuture<CreateMessageResult> + Send + Sync>;

/// Observes server `notifications/*/list_changed` broadcasts; receives the
/// freshly re-fetched list.
pub type ToolsChangeConsumer = Arc<dyn Fn(Vec<Tool>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ResourcesChangeConsumer =
    Arc<dyn Fn(Vec<Resource>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type PromptsChangeConsumer = Arc<dyn Fn(Vec<Prompt>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Observes `notifications/message` log records from the server.
pub type LoggingConsumer =
    Arc<dyn Fn(LoggingMessageNotification) -> BoxFuture<'static, ()> + Send + Sync>;

/// The MCP client bound to one session.
pub struct McpClient {
    session: Arc<McpSession>,
    client_info: Implementation,
    capabilities: ClientCapabilities,
    requested_version: String,
    server_info: RwLock<Option<Implementation>>,
    server_capabilities: RwLock<Option<ServerCapabilities>>,
    negotiated_version: RwLock<Option<String>>,
    instructions: RwLock<Option<String>>,
    roots: Arc<RwLock<Vec<Root>>>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("client_info", &self.client_info)
            .field("capabilities", &self.capabilities)
            .field("requested_version", &self.requested_version)
            .field("server_info", &self.server_info)
            .field("server_capabilities", &self.server_capabilities)
            .field("negotiated_version", &self.negotiated_version)
            .field("instructions", &self.instructions)
            .finish_non_exhaustive()
    }
}

impl McpClient {
    pub fn builder(transport: Arc<dyn Transport>) -> McpClientBuilder {
        McpClientBuilder::new(transport)
    }

    /// Runs the initialize handshake: sends `initialize`, records the
    /// negotiated protocol version and server identity, then emits
    /// `notifications/initialized`.
    pub async fn initialize(&self) -> Result<InitializeResult, Error> {
        let request = InitializeRequest {
            protocol_version: self.requested_version.clone(),
            capabilities: self.capabilities.clone(),
            client_info: self.client_info.clone(),
        };
        log::debug!(
            "initializing client {} with protocol {}",
            self.client_info.name,
            self.requested_version
        );
        let result: InitializeResult = self
            .session
            .send_request(methods::INITIALIZE, Some(serde_json::to_value(request)?))
            .await?;

        if result.protocol_version != self.requested_version {
            log::warn!(
                "server negotiated protocol version {} instead of requested {}",
                result.protocol_version,
                self.requested_version
            );
        }
        *self.server_info.write().unwrap() = Some(result.server_info.clone());
        *self.server_capabilities.write().unwrap() = Some(result.capabilities.clone());
        *self.negotiated_version.write().unwrap() = Some(result.protocol_version.clone());
        *self.instructions.write().unwrap() = result.instructions.clone();

        self.session
            .send_notification(methods::NOTIFICATION_INITIALIZED, None)
            .await?;
        Ok(result)
    }

    fn ensure_initialized(&self, operation: &str) -> Result<(), Error> {
        if self.negotiated_version.read().unwrap().is_none() {
            return Err(Error::Other(format!(
                "Client must be initialized before {operation}"
            )));
        }
        Ok(())
    }

    /// Server identity from the handshake.
    pub fn server_info(&self) -> Option<Implementation> {
        self.server_info.read().unwrap().clone()
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.server_capabilities.read().unwrap().clone()
    }

    pub fn negotiated_version(&self) -> Option<String> {
        self.negotiated_version.read().unwrap().clone()
    }

    pub fn instructions(&self) -> Option<String> {
        self.instructions.read().unwrap().clone()
    }

    /// Liveness probe; always permitted, even before initialization.
    pub async fn ping(&self) -> Result<(), Error> {
        let _: Value = self.session.send_request(methods::PING, None).await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Tools
    // -----------------------------------------------------------------

    pub async fn list_tools(&self) -> Result<ListToolsResult, Error> {
        self.ensure_initialized("listing tools")?;
        self.session
            .send_request(methods::TOOLS_LIST, Some(json!({})))
            .await
    }

    pub async fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResult, Error> {
        self.ensure_initialized("calling tools")?;
        self.session
            .send_request(methods::TOOLS_CALL, Some(serde_json::to_value(request)?))
            .await
    }

    // -----------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------

    pub async fn list_resources(&self) -> Result<ListResourcesResult, Error> {
        self.ensure_initialized("listing resources")?;
        self.session
            .send_request(methods::RESOURCES_LIST, Some(json!({})))
            .await
    }

    pub async fn read_resource(
        &self,
        request: ReadResourceRequest,
    ) -> Result<ReadResourceResult, Error> {
        self.ensure_initialized("reading resources")?;
        self.session
            .send_request(methods::RESOURCES_READ, Some(serde_json::to_value(request)?))
            .await
    }

    pub async fn list_resource_templates(&self) -> Result<ListResourceTemplatesResult, Error> {
        self.ensure_initialized("listing resource templates")?;
        self.session
            .send_request(methods::RESOURCES_TEMPLATES_LIST, Some(json!({})))
            .await
    }

    pub async fn subscribe_resource(&self, uri: impl Into<String>) -> Result<(), Error> {
        self.ensure_initialized("subscribing to resources")?;
        let _: Value = self
            .session
            .send_request(
                methods::RESOURCES_SUBSCRIBE,
                Some(json!({"uri": uri.into()})),
            )
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: impl Into<String>) -> Result<(), Error> {
        self.ensure_initialized("unsubscribing from resources")?;
        let _: Value = self
            .session
            .send_request(
                methods::RESOURCES_UNSUBSCRIBE,
                Some(json!({"uri": uri.into()})),
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Prompts
    // -----------------------------------------------------------------

    pub async fn list_prompts(&self) -> Result<ListPromptsResult, Error> {
        self.ensure_initialized("listing prompts")?;
        self.session
            .send_request(methods::PROMPTS_LIST, Some(json!({})))
            .await
    }

    pub async fn get_prompt(&self, request: GetPromptRequest) -> Result<GetPromptResult, Error> {
        self.ensure_initialized("getting prompts")?;
        self.session
            .send_request(methods::PROMPTS_GET, Some(serde_json::to_value(request)?))
            .await
    }

    // -----------------------------------------------------------------
    // Completion & logging
    // -----------------------------------------------------------------

    pub async fn complete(&self, request: CompleteRequest) -> Result<CompleteResult, Error> {
        self.ensure_initialized("requesting completions")?;
        self.session
            .send_request(
                methods::COMPLETION_COMPLETE,
                Some(serde_json::to_value(request)?),
            )
            .await
    }

    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<(), Error> {
        self.ensure_initialized("setting the logging level")?;
        let _: Value = self
            .session
            .send_request(methods::LOGGING_SET_LEVEL, Some(json!({"level": level})))
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Roots registry (client side)
    // -----------------------------------------------------------------

    pub fn roots(&self) -> Vec<Root> {
        self.roots.read().unwrap().clone()
    }

    /// Adds a root; the URI must use the `file://` scheme and be unique.
    /// Broadcasts `notifications/roots/list_changed` when declared.
    pub async fn add_root(&self, root: Root) -> Result<(), Error> {
        validate_root(&root)?;
        {
            let mut roots = self.roots.write().unwrap();
            if roots.iter().any(|r| r.uri == root.uri) {
                return Err(Error::Other(format!(
                    "Root with URI '{}' already exists",
                    root.uri
                )));
            }
            roots.push(root);
        }
        self.notify_roots_changed_if_declared().await
    }

    pub async fn remove_root(&self, uri: &str) -> Result<(), Error> {
        {
            let mut roots = self.roots.write().unwrap();
            let before = roots.len();
            roots.retain(|r| r.uri != uri);
            if roots.len() == before {
                return Err(Error::Other(format!("Root with URI '{}' not found", uri)));
            }
        }
        self.notify_roots_changed_if_declared().await
    }

    async fn notify_roots_changed_if_declared(&self) -> Result<(), Error> {
        let declared = self
            .capabilities
            .roots
            .as_ref()
            .and_then(|r| r.list_changed)
            .unwrap_or(false);
        if declared {
            self.session
                .send_notification(methods::NOTIFICATION_ROOTS_LIST_CHANGED, None)
                .await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    pub async fn close_gracefully(&self) -> Result<(), Error> {
        self.session.close_gracefully().await
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.session.close().await
    }
}

fn validate_root(root: &Root) -> Result<(), Error> {
    if !root.uri.starts_with("file://") {
        return Err(Error::Other(format!(
            "Root URI must start with file:// but was '{}'",
            root.uri
        )));
    }
    Ok(())
}

fn log_level_for(level: LoggingLevel) -> log::Level {
    match level {
        LoggingLevel::Debug => log::Level::Debug,
        LoggingLevel::Info | LoggingLevel::Notice => log::Level::Info,
        LoggingLevel::Warning => log::Level::Warn,
        _ => log::Level::Error,
    }
}

/// Builder for [`McpClient`]; constructing installs the session handlers for
/// the declared capabilities and starts the receive loop.
pub struct McpClientBuilder {
    transport: Arc<dyn Transport>,
    client_info: Implementation,
    capabilities: ClientCapabilities,
    requested_version: String,
    request_timeout: Duration,
    sampling_handler: Option<SamplingHandler>,
    roots: Vec<Root>,
    tools_change_consumers: Vec<ToolsChangeConsumer>,
    resources_change_consumers: Vec<ResourcesChangeConsumer>,
    prompts_change_consumers: Vec<PromptsChangeConsumer>,
    logging_consumers: Vec<LoggingConsumer>,
}

impl McpClientBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            client_info: Implementation::new("mcp-conduit-client", env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilities::default(),
            requested_version: LATEST_PROTOCOL_VERSION.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sampling_handler: None,
            roots: Vec::new(),
            tools_change_consumers: Vec::new(),
            resources_change_consumers: Vec::new(),
            prompts_change_consumers: Vec::new(),
            logging_consumers: Vec::new(),
        }
    }

    pub fn client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = Implementation::new(name, version);
        self
    }

    /// Applies identity and timeout from a [`CommonConfig`](crate::config::CommonConfig).
    pub fn config(mut self, config: &crate::config::CommonConfig) -> Self {
        self.client_info = Implementation::new(config.name.clone(), config.version.clone());
        self.request_timeout = config.request_timeout();
        self
    }

    pub fn capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// The protocol version offered in `initialize`.
    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.requested_version = version.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Required when the sampling capability is declared.
    pub fn sampling_handler(mut self, handler: SamplingHandler) -> Self {
        self.sampling_handler = Some(handler);
        self
    }

    pub fn root(mut self, root: Root) -> Self {
        self.roots.push(root);
        self
    }

    pub fn on_tools_changed(mut self, consumer: ToolsChangeConsumer) -> Self {
        self.tools_change_consumers.push(consumer);
        self
    }

    pub fn on_resources_changed(mut self, consumer: ResourcesChangeConsumer) -> Self {
        self.resources_change_consumers.push(consumer);
        self
    }

    pub fn on_prompts_changed(mut self, consumer: PromptsChangeConsumer) -> Self {
        self.prompts_change_consumers.push(consumer);
        self
    }

    pub fn on_log_message(mut self, consumer: LoggingConsumer) -> Self {
        self.logging_consumers.push(consumer);
        self
    }

    pub fn build(self) -> Result<Arc<McpClient>, Error> {
        if self.capabilities.sampling.is_some() && self.sampling_handler.is_none() {
            return Err(Error::Other(
                "Sampling handler must be provided when the sampling capability is declared"
                    .into(),
            ));
        }
        for root in &self.roots {
            validate_root(root)?;
        }
        let mut seen = std::collections::HashSet::new();
        for root in &self.roots {
            if !seen.insert(root.uri.clone()) {
                return Err(Error::Other(format!(
                    "Root with URI '{}' already exists",
                    root.uri
                )));
            }
        }

        let roots = Arc::new(RwLock::new(self.roots));
        let request_handlers = build_request_handlers(
            &self.capabilities,
            self.sampling_handler,
            roots.clone(),
        );
        let notification_handlers = build_notification_handlers(
            self.tools_change_consumers,
            self.resources_change_consumers,
            self.prompts_change_consumers,
            self.logging_consumers,
        );

        let session = McpSession::new(
            uuid::Uuid::new_v4().to_string(),
            self.request_timeout,
            self.transport,
            Phase::Initialized,
            request_handlers,
            notification_handlers,
        );
        session.start();

        Ok(Arc::new(McpClient {
            session,
            client_info: self.client_info,
            capabilities: self.capabilities,
            requested_version: self.requested_version,
            server_info: RwLock::new(None),
            server_capabilities: RwLock::new(None),
            negotiated_version: RwLock::new(None),
            instructions: RwLock::new(None),
            roots,
        }))
    }
}

fn build_request_handlers(
    capabilities: &ClientCapabilities,
    sampling_handler: Option<SamplingHandler>,
    roots: Arc<RwLock<Vec<Root>>>,
) -> HashMap<String, RequestHandler> {
    let mut handlers: HashMap<String, RequestHandler> = HashMap::new();

    handlers.insert(
        methods::PING.to_string(),
        Arc::new(|_session, _params| -> HandlerFuture<Value> {
            Box::pin(async { Ok(json!({})) })
        }),
    );

    // roots/list answers only when the roots capability was declared;
    // otherwise the session responds METHOD_NOT_FOUND with the reason hint.
    if capabilities.roots.is_some() {
        handlers.insert(
            methods::ROOTS_LIST.to_string(),
            Arc::new(move |_session, _params| -> HandlerFuture<Value> {
                let roots = roots.clone();
                Box::pin(async move {
                    let roots = roots.read().unwrap().clone();
                    Ok(serde_json::to_value(ListRootsResult { roots })?)
                })
            }),
        );
    }

    if capabilities.sampling.is_some() {
        // Presence enforced by the builder.
        if let Some(handler) = sampling_handler {
            handlers.insert(
                methods::SAMPLING_CREATE_MESSAGE.to_string(),
                Arc::new(move |_session, params| -> HandlerFuture<Value> {
                    let handler = handler.clone();
                    Box::pin(async move {
                        let request: CreateMessageRequest =
                            serde_json::from_value(params.unwrap_or(Value::Null)).map_err(
                                |e| {
                                    crate::error::Error::protocol(
                                        crate::error::ErrorCode::InvalidParams,
                                        format!("Invalid params: {e}"),
                                    )
                                },
                            )?;
                        let result = handler(request).await?;
                        Ok(serde_json::to_value(result)?)
                    })
                }),
            );
        }
    }

    handlers
}

fn build_notification_handlers(
    tools_change_consumers: Vec<ToolsChangeConsumer>,
    resources_change_consumers: Vec<ResourcesChangeConsumer>,
    prompts_change_consumers: Vec<PromptsChangeConsumer>,
    logging_consumers: Vec<LoggingConsumer>,
) -> HashMap<String, NotificationHandler> {
    let mut handlers: HashMap<String, NotificationHandler> = HashMap::new();

    if !tools_change_consumers.is_empty() {
        let consumers = tools_change_consumers;
        handlers.insert(
            methods::NOTIFICATION_TOOLS_LIST_CHANGED.to_string(),
            Arc::new(move |session, _params| -> HandlerFuture<()> {
                let consumers = consumers.clone();
                Box::pin(async move {
                    let result: ListToolsResult = session
                        .send_request(methods::TOOLS_LIST, Some(json!({})))
                        .await?;
                    for consumer in &consumers {
                        consumer(result.tools.clone()).await;
                    }
                    Ok(())
                })
            }),
        );
    }

    if !resources_change_consumers.is_empty() {
        let consumers = resources_change_consumers;
        handlers.insert(
            methods::NOTIFICATION_RESOURCES_LIST_CHANGED.to_string(),
            Arc::new(move |session, _params| -> HandlerFuture<()> {
                let consumers = consumers.clone();
                Box::pin(async move {
                    let result: ListResourcesResult = session
                        .send_request(methods::RESOURCES_LIST, Some(json!({})))
                        .await?;
                    for consumer in &consumers {
                        consumer(result.resources.clone()).await;
                    }
                    Ok(())
                })
            }),
        );
    }

    if !prompts_change_consumers.is_empty() {
        let consumers = prompts_change_consumers;
        handlers.insert(
            methods::NOTIFICATION_PROMPTS_LIST_CHANGED.to_string(),
            Arc::new(move |session, _params| -> HandlerFuture<()> {
                let consumers = consumers.clone();
                Box::pin(async move {
                    let result: ListPromptsResult = session
                        .send_request(methods::PROMPTS_LIST, Some(json!({})))
                        .await?;
                    for consumer in &consumers {
                        consumer(result.prompts.clone()).await;
                    }
                    Ok(())
                })
            }),
        );
    }

    // Server log records: default to the process logger when the host
    // installed no consumer.
    handlers.insert(
        methods::NOTIFICATION_MESSAGE.to_string(),
        Arc::new(move |_session, params| -> HandlerFuture<()> {
            let consumers = logging_consumers.clone();
            Box::pin(async move {
                let notification: LoggingMessageNotification =
                    serde_json::from_value(params.unwrap_or(Value::Null))?;
                if consumers.is_empty() {
                    log::log!(
                        log_level_for(notification.level),
                        "[{}] {}",
                        notification.logger.as_deref().unwrap_or("server"),
                        notification.data
                    );
                    return Ok(());
                }
                for consumer in &consumers {
                    consumer(notification.clone()).await;
                }
                Ok(())
            })
        }),
    );

    handlers
}
