//! Server side of the protocol: capability gating, feature registries, and
//! the session factory wiring it all to a transport provider.
//!
//! The [`McpServerBuilder`] assembles the request-handler table from the
//! declared [`ServerCapabilities`]: a method is only registered when its
//! capability is present, so calls against undeclared capabilities fail with
//! `METHOD_NOT_FOUND` at the session layer. Registries are runtime-mutable;
//! mutations broadcast the matching `list_changed` notification when the
//! capability declares it.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use crate::error::{Error, ErrorCode};
use crate::protocol::{methods, LATEST_PROTOCOL_VERSION};
use crate::session::{
    HandlerFuture, McpSession, NotificationHandler, Phase, RequestHandler,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::tool::{FunctionTool, ToolContext};
use crate::transport::{ServerTransportProvider, SessionFactory};
use crate::types::*;
use crate::uri_template::UriTemplate;

pub mod exchange;

pub use exchange::ServerExchange;

/// Serves `resources/read` for one registered resource.
pub type ResourceReadHandler = Arc<
    dyn Fn(ServerExchange, ReadResourceRequest) -> HandlerFuture<ReadResourceResult>
        + Send
        + Sync,
>;

/// Serves `prompts/get` for one registered prompt.
pub type PromptHandler =
    Arc<dyn Fn(ServerExchange, GetPromptRequest) -> HandlerFuture<GetPromptResult> + Send + Sync>;

/// Serves `completion/complete` for one registered reference.
pub type CompletionHandler =
    Arc<dyn Fn(ServerExchange, CompleteRequest) -> HandlerFuture<CompleteResult> + Send + Sync>;

/// Invoked after the client announces a roots change, with the fresh list.
pub type RootsChangeConsumer =
    Arc<dyn Fn(ServerExchange, Vec<Root>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A registered resource: descriptor, compiled template, read handler.
#[derive(Clone)]
struct ResourceSpec {
    resource: Resource,
    template: UriTemplate,
    read_handler: ResourceReadHandler,
}

#[derive(Clone)]
struct PromptSpec {
    prompt: Prompt,
    handler: PromptHandler,
}

/// The MCP server: registries plus the transport provider they serve on.
pub struct McpServer {
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    /// Most recent first; the head is "the server's highest supported"
    protocol_versions: Vec<String>,
    provider: Arc<dyn ServerTransportProvider>,
    tools: RwLock<Vec<FunctionTool>>,
    resources: RwLock<Vec<ResourceSpec>>,
    prompts: RwLock<Vec<PromptSpec>>,
    completions: HashMap<CompleteReference, CompletionHandler>,
    subscriptions: RwLock<HashMap<String, HashSet<String>>>,
    roots_change_consumers: Vec<RootsChangeConsumer>,
}

impl McpServer {
    pub fn builder(provider: Arc<dyn ServerTransportProvider>) -> McpServerBuilder {
        McpServerBuilder::new(provider)
    }

    pub fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    // -----------------------------------------------------------------
    // Tool registry
    // -----------------------------------------------------------------

    /// Adds a tool at runtime, broadcasting `tools/list_changed` when the
    /// capability declares it. Duplicate names are rejected.
    pub async fn add_tool(&self, tool: FunctionTool) -> Result<(), Error> {
        let tools_cap = self
            .capabilities
            .tools
            .as_ref()
            .ok_or_else(|| Error::Other("Server must be configured with tool capabilities".into()))?
            .clone();
        {
            let mut tools = self.tools.write().unwrap();
            if tools.iter().any(|t| t.name() == tool.name()) {
                return Err(Error::Other(format!(
                    "Tool with name '{}' already exists",
                    tool.name()
                )));
            }
            log::debug!("added tool handler: {}", tool.name());
            tools.push(tool);
        }
        if tools_cap.list_changed == Some(true) {
            self.notify_tools_list_changed().await?;
        }
        Ok(())
    }

    /// Removes a tool by name; absent names are an error.
    pub async fn remove_tool(&self, tool_name: &str) -> Result<(), Error> {
        let tools_cap = self
            .capabilities
            .tools
            .as_ref()
            .ok_or_else(|| Error::Other("Server must be configured with tool capabilities".into()))?
            .clone();
        {
            let mut tools = self.tools.write().unwrap();
            let before = tools.len();
            tools.retain(|t| t.name() != tool_name);
            if tools.len() == before {
                return Err(Error::Other(format!(
                    "Tool with name '{}' not found",
                    tool_name
                )));
            }
            log::debug!("removed tool handler: {}", tool_name);
        }
        if tools_cap.list_changed == Some(true) {
            self.notify_tools_list_changed().await?;
        }
        Ok(())
    }

    pub async fn notify_tools_list_changed(&self) -> Result<(), Error> {
        self.provider
            .notify_clients(methods::NOTIFICATION_TOOLS_LIST_CHANGED, None)
            .await
    }

    // -----------------------------------------------------------------
    // Resource registry
    // -----------------------------------------------------------------

    /// Adds a resource (literal or template URI); duplicate URIs are
    /// rejected.
    pub async fn add_resource(
        &self,
        resource: Resource,
        read_handler: ResourceReadHandler,
    ) -> Result<(), Error> {
        let resources_cap = self
            .capabilities
            .resources
            .as_ref()
            .ok_or_else(|| {
                Error::Other("Server must be configured with resource capabilities".into())
            })?
            .clone();
        let template = UriTemplate::parse(&resource.uri)?;
        {
            let mut resources = self.resources.write().unwrap();
            if resources.iter().any(|r| r.resource.uri == resource.uri) {
                return Err(Error::Other(format!(
                    "Resource with URI '{}' already exists",
                    resource.uri
                )));
            }
            log::debug!("added resource handler: {}", resource.uri);
            resources.push(ResourceSpec {
                resource,
                template,
                read_handler,
            });
        }
        if resources_cap.list_changed == Some(true) {
            self.notify_resources_list_changed().await?;
        }
        Ok(())
    }

    pub async fn remove_resource(&self, uri: &str) -> Result<(), Error> {
        let resources_cap = self
            .capabilities
            .resources
            .as_ref()
            .ok_or_else(|| {
                Error::Other("Server must be configured with resource capabilities".into())
            })?
            .clone();
        {
            let mut resources = self.resources.write().unwrap();
            let before = resources.len();
            resources.retain(|r| r.resource.uri != uri);
            if resources.len() == before {
                return Err(Error::Other(format!(
                    "Resource with URI '{}' not found",
                    uri
                )));
            }
            log::debug!("removed resource handler: {}", uri);
        }
        if resources_cap.list_changed == Some(true) {
            self.notify_resources_list_changed().await?;
        }
        Ok(())
    }

    pub async fn notify_resources_list_changed(&self) -> Result<(), Error> {
        self.provider
            .notify_clients(methods::NOTIFICATION_RESOURCES_LIST_CHANGED, None)
            .await
    }

    // -----------------------------------------------------------------
    // Prompt registry
    // -----------------------------------------------------------------

    pub async fn add_prompt(&self, prompt: Prompt, handler: PromptHandler) -> Result<(), Error> {
        let prompts_cap = self
            .capabilities
            .prompts
            .as_ref()
            .ok_or_else(|| {
                Error::Other("Server must be configured with prompt capabilities".into())
            })?
            .clone();
        {
            let mut prompts = self.prompts.write().unwrap();
            if prompts.iter().any(|p| p.prompt.name == prompt.name) {
                return Err(Error::Other(format!(
                    "Prompt with name '{}' already exists",
                    prompt.name
                )));
            }
            log::debug!("added prompt handler: {}", prompt.name);
            prompts.push(PromptSpec { prompt, handler });
        }
        if prompts_cap.list_changed == Some(true) {
            self.notify_prompts_list_changed().await?;
        }
        Ok(())
    }

    pub async fn remove_prompt(&self, prompt_name: &str) -> Result<(), Error> {
        let prompts_cap = self
            .capabilities
            .prompts
            .as_ref()
            .ok_or_else(|| {
                Error::Other("Server must be configured with prompt capabilities".into())
            })?
            .clone();
        {
            let mut prompts = self.prompts.write().unwrap();
            let before = prompts.len();
            prompts.retain(|p| p.prompt.name != prompt_name);
            if prompts.len() == before {
                return Err(Error::Other(format!(
                    "Prompt with name '{}' not found",
                    prompt_name
                )));
            }
            log::debug!("removed prompt handler: {}", prompt_name);
        }
        if prompts_cap.list_changed == Some(true) {
            self.notify_prompts_list_changed().await?;
        }
        Ok(())
    }

    pub async fn notify_prompts_list_changed(&self) -> Result<(), Error> {
        self.provider
            .notify_clients(methods::NOTIFICATION_PROMPTS_LIST_CHANGED, None)
            .await
    }

    // -----------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------

    /// Broadcasts a log record to every connected client. Per-session level
    /// filtering happens on the [`ServerExchange`] path; this broadcast is
    /// unconditional.
    pub async fn logging_notification(
        &self,
        notification: LoggingMessageNotification,
    ) -> Result<(), Error> {
        self.provider
            .notify_clients(
                methods::NOTIFICATION_MESSAGE,
                Some(serde_json::to_value(notification)?),
            )
            .await
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    pub async fn close_gracefully(&self) -> Result<(), Error> {
        self.provider.close_gracefully().await
    }

    pub fn close(&self) {
        self.provider.close();
    }

    // -----------------------------------------------------------------
    // Request handling internals
    // -----------------------------------------------------------------

    fn negotiate_protocol_version(&self, requested: &str) -> String {
        if self.protocol_versions.iter().any(|v| v == requested) {
            requested.to_string()
        } else {
            let highest = self
                .protocol_versions
                .first()
                .cloned()
                .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string());
            log::warn!(
                "client requested unsupported protocol version {}, suggesting {} instead",
                requested,
                highest
            );
            highest
        }
    }

    fn handle_initialize(
        &self,
        session: &Arc<McpSession>,
        request: InitializeRequest,
    ) -> Result<InitializeResult, Error> {
        if !session.try_begin_initialize() {
            return Err(Error::protocol(
                ErrorCode::InvalidRequest,
                "Server already initialized",
            ));
        }
        log::info!(
            "client initialize request - protocol: {}, info: {} {}",
            request.protocol_version,
            request.client_info.name,
            request.client_info.version
        );
        session.set_client_info(request.client_info, request.capabilities);
        Ok(InitializeResult {
            protocol_version: self.negotiate_protocol_version(&request.protocol_version),
            capabilities: self.capabilities.clone(),
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        })
    }

    fn list_tools(&self) -> ListToolsResult {
        let tools = self
            .tools
            .read()
            .unwrap()
            .iter()
            .map(|t| t.tool().clone())
            .collect();
        ListToolsResult {
            tools,
            next_cursor: None,
        }
    }

    fn find_tool(&self, name: &str) -> Option<FunctionTool> {
        self.tools
            .read()
            .unwrap()
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    fn list_resources(&self) -> ListResourcesResult {
        let resources = self
            .resources
            .read()
            .unwrap()
            .iter()
            .map(|r| r.resource.clone())
            .collect();
        ListResourcesResult {
            resources,
            next_cursor: None,
        }
    }

    fn list_resource_templates(&self) -> ListResourceTemplatesResult {
        let resource_templates = self
            .resources
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.template.is_templated())
            .map(|r| ResourceTemplate {
                uri_template: r.resource.uri.clone(),
                name: r.resource.name.clone(),
                description: r.resource.description.clone(),
                mime_type: r.resource.mime_type.clone(),
                annotations: r.resource.annotations.clone(),
            })
            .collect();
        ListResourceTemplatesResult {
            resource_templates,
            next_cursor: None,
        }
    }

    /// First registered URI (in insertion order) matching the requested one
    /// under RFC-6570 expansion wins.
    fn resolve_resource(&self, uri: &str) -> Option<ResourceSpec> {
        self.resources
            .read()
            .unwrap()
            .iter()
            .find(|r| r.template.matches(uri))
            .cloned()
    }

    fn resource_registered(&self, uri: &str) -> bool {
        self.resources
            .read()
            .unwrap()
            .iter()
            .any(|r| r.template.matches(uri))
    }

    fn subscribe(&self, session_id: &str, uri: &str) -> Result<(), Error> {
        if !self.resource_registered(uri) {
            return Err(Error::Other(format!("Resource not found: {}", uri)));
        }
        self.subscriptions
            .write()
            .unwrap()
            .entry(uri.to_string())
            .or_default()
            .insert(session_id.to_string());
        Ok(())
    }

    fn unsubscribe(&self, session_id: &str, uri: &str) {
        let mut subscriptions = self.subscriptions.write().unwrap();
        if let Some(sessions) = subscriptions.get_mut(uri) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                subscriptions.remove(uri);
            }
        }
    }

    fn list_prompts(&self) -> ListPromptsResult {
        let prompts = self
            .prompts
            .read()
            .unwrap()
            .iter()
            .map(|p| p.prompt.clone())
            .collect();
        ListPromptsResult {
            prompts,
            next_cursor: None,
        }
    }

    fn find_prompt(&self, name: &str) -> Option<PromptSpec> {
        self.prompts
            .read()
            .unwrap()
            .iter()
            .find(|p| p.prompt.name == name)
            .cloned()
    }

    /// Validates a completion reference against the registries before the
    /// registered handler runs.
    fn validate_complete_reference(&self, request: &CompleteRequest) -> Result<(), Error> {
        match &request.reference {
            CompleteReference::Prompt { name } => {
                let spec = self
                    .find_prompt(name)
                    .ok_or_else(|| Error::Other(format!("Prompt not found: {}", name)))?;
                let known = spec
                    .prompt
                    .arguments
                    .iter()
                    .any(|a| a.name == request.argument.name);
                if !known {
                    return Err(Error::Other(format!(
                        "Argument not found: {}",
                        request.argument.name
                    )));
                }
            }
            CompleteReference::Resource { uri } => {
                let resources = self.resources.read().unwrap();
                let spec = resources
                    .iter()
                    .find(|r| &r.resource.uri == uri)
                    .ok_or_else(|| Error::Other(format!("Resource not found: {}", uri)))?;
                let known = spec
                    .template
                    .variable_names()
                    .iter()
                    .any(|v| v == &request.argument.name);
                if !known {
                    return Err(Error::Other(format!(
                        "Argument not found: {}",
                        request.argument.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn params_as<T: DeserializeOwned>(params: Option<Value>) -> Result<T, Error> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| Error::protocol(ErrorCode::InvalidParams, format!("Invalid params: {e}")))
}

fn upgraded(server: &Weak<McpServer>) -> Result<Arc<McpServer>, Error> {
    server.upgrade().ok_or(Error::SessionClosed)
}

/// Builds the capability-gated handler tables and wires the session factory
/// into the provider.
pub struct McpServerBuilder {
    provider: Arc<dyn ServerTransportProvider>,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    protocol_versions: Vec<String>,
    request_timeout: Duration,
    tools: Vec<FunctionTool>,
    resources: Vec<(Resource, ResourceReadHandler)>,
    prompts: Vec<(Prompt, PromptHandler)>,
    completions: HashMap<CompleteReference, CompletionHandler>,
    roots_change_consumers: Vec<RootsChangeConsumer>,
}

impl McpServerBuilder {
    fn new(provider: Arc<dyn ServerTransportProvider>) -> Self {
        Self {
            provider,
            server_info: Implementation::new("mcp-conduit-server", env!("CARGO_PKG_VERSION")),
            capabilities: ServerCapabilities::default(),
            instructions: None,
            protocol_versions: crate::protocol::SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            completions: HashMap::new(),
            roots_change_consumers: Vec::new(),
        }
    }

    pub fn server_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.server_info = Implementation::new(name, version);
        self
    }

    /// Applies identity, timeout, and instructions from a [`ServerConfig`].
    pub fn config(mut self, config: &crate::config::ServerConfig) -> Self {
        self.server_info =
            Implementation::new(config.common.name.clone(), config.common.version.clone());
        self.request_timeout = config.common.request_timeout();
        self.instructions = config.instructions.clone();
        self
    }

    pub fn capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Supported versions, most recent first. Exposed as configuration so
    /// deployments are not pinned to this crate's defaults.
    pub fn protocol_versions(mut self, versions: Vec<String>) -> Self {
        self.protocol_versions = versions;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn tool(mut self, tool: FunctionTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn resource(mut self, resource: Resource, read_handler: ResourceReadHandler) -> Self {
        self.resources.push((resource, read_handler));
        self
    }

    pub fn prompt(mut self, prompt: Prompt, handler: PromptHandler) -> Self {
        self.prompts.push((prompt, handler));
        self
    }

    pub fn completion(
        mut self,
        reference: CompleteReference,
        handler: CompletionHandler,
    ) -> Self {
        self.completions.insert(reference, handler);
        self
    }

    pub fn roots_change_consumer(mut self, consumer: RootsChangeConsumer) -> Self {
        self.roots_change_consumers.push(consumer);
        self
    }

    /// Validates the initial registrations, constructs the server, and
    /// installs its session factory on the provider.
    pub fn build(self) -> Result<Arc<McpServer>, Error> {
        let duplicates = crate::tool::duplicate_tool_names(&self.tools);
        if !duplicates.is_empty() {
            return Err(Error::Other(format!(
                "Multiple tools with the same name: {}",
                duplicates.join(", ")
            )));
        }

        let mut resources = Vec::new();
        let mut seen_uris = HashSet::new();
        for (resource, read_handler) in self.resources {
            if !seen_uris.insert(resource.uri.clone()) {
                return Err(Error::Other(format!(
                    "Resource with URI '{}' already exists",
                    resource.uri
                )));
            }
            let template = UriTemplate::parse(&resource.uri)?;
            resources.push(ResourceSpec {
                resource,
                template,
                read_handler,
            });
        }

        let mut prompts = Vec::new();
        let mut seen_prompts = HashSet::new();
        for (prompt, handler) in self.prompts {
            if !seen_prompts.insert(prompt.name.clone()) {
                return Err(Error::Other(format!(
                    "Prompt with name '{}' already exists",
                    prompt.name
                )));
            }
            prompts.push(PromptSpec { prompt, handler });
        }

        let server = Arc::new(McpServer {
            server_info: self.server_info,
            capabilities: self.capabilities,
            instructions: self.instructions,
            protocol_versions: self.protocol_versions,
            provider: self.provider.clone(),
            tools: RwLock::new(self.tools),
            resources: RwLock::new(resources),
            prompts: RwLock::new(prompts),
            completions: self.completions,
            subscriptions: RwLock::new(HashMap::new()),
            roots_change_consumers: self.roots_change_consumers,
        });

        let factory = session_factory(&server, self.request_timeout);
        self.provider.set_session_factory(factory);
        Ok(server)
    }
}

/// Assembles the per-session dispatch tables and returns the factory the
/// provider calls for every accepted connection.
fn session_factory(server: &Arc<McpServer>, request_timeout: Duration) -> SessionFactory {
    let request_handlers = build_request_handlers(server);
    let notification_handlers = build_notification_handlers(server);

    Arc::new(move |transport| {
        let session = McpSession::new(
            uuid::Uuid::new_v4().to_string(),
            request_timeout,
            transport,
            Phase::Uninitialized,
            request_handlers.clone(),
            notification_handlers.clone(),
        );
        session.start();
        session
    })
}

fn build_request_handlers(server: &Arc<McpServer>) -> HashMap<String, RequestHandler> {
    let mut handlers: HashMap<String, RequestHandler> = HashMap::new();

    // Ping must answer with an empty object, not null.
    handlers.insert(
        methods::PING.to_string(),
        Arc::new(|_session, _params| -> HandlerFuture<Value> {
            Box::pin(async { Ok(json!({})) })
        }),
    );

    let weak = Arc::downgrade(server);
    handlers.insert(
        methods::INITIALIZE.to_string(),
        Arc::new(move |session, params| -> HandlerFuture<Value> {
            let weak = weak.clone();
            Box::pin(async move {
                let server = upgraded(&weak)?;
                let request: InitializeRequest = params_as(params)?;
                let result = server.handle_initialize(&session, request)?;
                Ok(serde_json::to_value(result)?)
            })
        }),
    );

    if server.capabilities.tools.is_some() {
        let weak = Arc::downgrade(server);
        handlers.insert(
            methods::TOOLS_LIST.to_string(),
            Arc::new(move |_session, _params| -> HandlerFuture<Value> {
                let weak = weak.clone();
                Box::pin(async move {
                    let server = upgraded(&weak)?;
                    Ok(serde_json::to_value(server.list_tools())?)
                })
            }),
        );

        let weak = Arc::downgrade(server);
        handlers.insert(
            methods::TOOLS_CALL.to_string(),
            Arc::new(move |session, params| -> HandlerFuture<Value> {
                let weak = weak.clone();
                Box::pin(async move {
                    let server = upgraded(&weak)?;
                    let request: CallToolRequest = params_as(params)?;
                    let tool = server
                        .find_tool(&request.name)
                        .ok_or_else(|| Error::Other(format!("Tool not found: {}", request.name)))?;
                    let context = ToolContext::default().with_session(session);
                    let result = tool
                        .invoke(request.arguments.unwrap_or_default(), context)
                        .await;
                    Ok(serde_json::to_value(result)?)
                })
            }),
        );
    }

    if let Some(resources_cap) = &server.capabilities.resources {
        let weak = Arc::downgrade(server);
        handlers.insert(
            methods::RESOURCES_LIST.to_string(),
            Arc::new(move |_session, _params| -> HandlerFuture<Value> {
                let weak = weak.clone();
                Box::pin(async move {
                    let server = upgraded(&weak)?;
                    Ok(serde_json::to_value(server.list_resources())?)
                })
            }),
        );

        let weak = Arc::downgrade(server);
        handlers.insert(
            methods::RESOURCES_READ.to_string(),
            Arc::new(move |session, params| -> HandlerFuture<Value> {
                let weak = weak.clone();
                Box::pin(async move {
                    let server = upgraded(&weak)?;
                    let request: ReadResourceRequest = params_as(params)?;
                    let spec = server.resolve_resource(&request.uri).ok_or_else(|| {
                        Error::Other(format!("Resource not found: {}", request.uri))
                    })?;
                    let exchange = ServerExchange::new(session);
                    let result = (spec.read_handler)(exchange, request).await?;
                    Ok(serde_json::to_value(result)?)
                })
            }),
        );

        let weak = Arc::downgrade(server);
        handlers.insert(
            methods::RESOURCES_TEMPLATES_LIST.to_string(),
            Arc::new(move |_session, _params| -> HandlerFuture<Value> {
                let weak = weak.clone();
                Box::pin(async move {
                    let server = upgraded(&weak)?;
                    Ok(serde_json::to_value(server.list_resource_templates())?)
                })
            }),
        );

        if resources_cap.subscribe == Some(true) {
            let weak = Arc::downgrade(server);
            handlers.insert(
                methods::RESOURCES_SUBSCRIBE.to_string(),
                Arc::new(move |session, params| -> HandlerFuture<Value> {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let server = upgraded(&weak)?;
                        let request: SubscribeRequest = params_as(params)?;
                        server.subscribe(session.id(), &request.uri)?;
                        Ok(json!({}))
                    })
                }),
            );

            let weak = Arc::downgrade(server);
            handlers.insert(
                methods::RESOURCES_UNSUBSCRIBE.to_string(),
                Arc::new(move |session, params| -> HandlerFuture<Value> {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let server = upgraded(&weak)?;
                        let request: UnsubscribeRequest = params_as(params)?;
                        server.unsubscribe(session.id(), &request.uri);
                        Ok(json!({}))
                    })
                }),
            );
        }
    }

    if server.capabilities.prompts.is_some() {
        let weak = Arc::downgrade(server);
        handlers.insert(
            methods::PROMPTS_LIST.to_string(),
            Arc::new(move |_session, _params| -> HandlerFuture<Value> {
                let weak = weak.clone();
                Box::pin(async move {
                    let server = upgraded(&weak)?;
                    Ok(serde_json::to_value(server.list_prompts())?)
                })
            }),
        );

        let weak = Arc::downgrade(server);
        handlers.insert(
            methods::PROMPTS_GET.to_string(),
            Arc::new(move |session, params| -> HandlerFuture<Value> {
                let weak = weak.clone();
                Box::pin(async move {
                    let server = upgraded(&weak)?;
                    let request: GetPromptRequest = params_as(params)?;
                    let spec = server.find_prompt(&request.name).ok_or_else(|| {
                        Error::Other(format!("Prompt not found: {}", request.name))
                    })?;
                    // Argument names the client supplies must be declared.
                    if let Some(arguments) = &request.arguments {
                        for name in arguments.keys() {
                            if !spec.prompt.arguments.iter().any(|a| &a.name == name) {
                                return Err(Error::protocol(
                                    ErrorCode::InvalidParams,
                                    format!("Unknown prompt argument: {}", name),
                                ));
                            }
                        }
                    }
                    let exchange = ServerExchange::new(session);
                    let result = (spec.handler)(exchange, request).await?;
                    Ok(serde_json::to_value(result)?)
                })
            }),
        );
    }

    if server.capabilities.logging.is_some() {
        handlers.insert(
            methods::LOGGING_SET_LEVEL.to_string(),
            Arc::new(move |session, params| -> HandlerFuture<Value> {
                Box::pin(async move {
                    let request: SetLevelRequest = params_as(params)?;
                    session.set_min_log_level(request.level);
                    Ok(json!({}))
                })
            }),
        );
    }

    if server.capabilities.completions.is_some() {
        let weak = Arc::downgrade(server);
        handlers.insert(
            methods::COMPLETION_COMPLETE.to_string(),
            Arc::new(move |session, params| -> HandlerFuture<Value> {
                let weak = weak.clone();
                Box::pin(async move {
                    let server = upgraded(&weak)?;
                    let request: CompleteRequest = params_as(params)?;
                    server.validate_complete_reference(&request)?;
                    let handler = server.completions.get(&request.reference).ok_or_else(|| {
                        Error::Other(format!(
                            "Completion handler not found: {:?}",
                            request.reference
                        ))
                    })?;
                    let exchange = ServerExchange::new(session);
                    let result = handler(exchange, request).await?;
                    Ok(serde_json::to_value(result)?)
                })
            }),
        );
    }

    handlers
}

fn build_notification_handlers(server: &Arc<McpServer>) -> HashMap<String, NotificationHandler> {
    let mut handlers: HashMap<String, NotificationHandler> = HashMap::new();

    handlers.insert(
        methods::NOTIFICATION_INITIALIZED.to_string(),
        Arc::new(|_session, _params| -> HandlerFuture<()> { Box::pin(async { Ok(()) }) }),
    );

    let weak = Arc::downgrade(server);
    handlers.insert(
        methods::NOTIFICATION_ROOTS_LIST_CHANGED.to_string(),
        Arc::new(move |session, _params| -> HandlerFuture<()> {
            let weak = weak.clone();
            Box::pin(async move {
                let server = upgraded(&weak)?;
                session.invalidate_roots_cache();
                let exchange = ServerExchange::new(session);
                let roots = exchange.list_roots().await?.roots;
                if server.roots_change_consumers.is_empty() {
                    log::warn!(
                        "roots list changed notification, but no consumers provided: {:?}",
                        roots
                    );
                    return Ok(());
                }
                for consumer in &server.roots_change_consumers {
                    consumer(exchange.clone(), roots.clone()).await;
                }
                Ok(())
            })
        }),
    );

    handlers
}
