//! Configuration surface for clients, servers, and their connections.
//!
//! Everything is plain serde data so hosts can embed these structs in their
//! own configuration files. Named stdio connections can additionally be
//! loaded from an external JSON document (the `mcpServers` map format used
//! by MCP host applications).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::Error;

fn default_enabled() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Whether the host consumes the blocking or the async surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiStyle {
    #[serde(rename = "SYNC")]
    Sync,
    #[default]
    #[serde(rename = "ASYNC")]
    Async,
}

/// Settings shared by client and server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub name: String,
    pub version: String,
    /// Outbound request deadline, in seconds
    #[serde(
        rename = "requestTimeout",
        default = "default_request_timeout_secs"
    )]
    pub request_timeout_secs: u64,
    /// Run the initialize handshake automatically on start
    #[serde(default = "default_enabled")]
    pub initialized: bool,
    #[serde(rename = "type", default)]
    pub api_style: ApiStyle,
    /// Expose registered callables as MCP tools
    #[serde(rename = "toolcallbackEnabled", default = "default_enabled")]
    pub toolcallback_enabled: bool,
}

impl CommonConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            enabled: true,
            name: name.into(),
            version: version.into(),
            request_timeout_secs: default_request_timeout_secs(),
            initialized: true,
            api_style: ApiStyle::Async,
            toolcallback_enabled: true,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Which server-side transport binding to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerTransportKind {
    #[default]
    #[serde(rename = "STDIO")]
    Stdio,
    #[serde(rename = "SSE")]
    Sse,
}

fn default_sse_endpoint() -> String {
    "/sse".to_string()
}

fn default_message_endpoint() -> String {
    "/mcp/message".to_string()
}

/// Server-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub transport: ServerTransportKind,
    #[serde(rename = "sseEndpoint", default = "default_sse_endpoint")]
    pub sse_endpoint: String,
    #[serde(rename = "sseMessageEndpoint", default = "default_message_endpoint")]
    pub sse_message_endpoint: String,
    #[serde(rename = "toolChangeNotification", default = "default_enabled")]
    pub tool_change_notification: bool,
    #[serde(rename = "resourceChangeNotification", default = "default_enabled")]
    pub resource_change_notification: bool,
    #[serde(rename = "promptChangeNotification", default = "default_enabled")]
    pub prompt_change_notification: bool,
    /// Per-tool override of how the adapter packages returned images
    #[serde(rename = "toolResponseMimeType", default)]
    pub tool_response_mime_type: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            common: CommonConfig::new(name, version),
            transport: ServerTransportKind::Stdio,
            sse_endpoint: default_sse_endpoint(),
            sse_message_endpoint: default_message_endpoint(),
            tool_change_notification: true,
            resource_change_notification: true,
            prompt_change_notification: true,
            tool_response_mime_type: HashMap::new(),
            instructions: None,
        }
    }
}

/// How to launch one stdio-connected server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioConnection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl StdioConnection {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// One SSE-connected server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SseConnection {
    pub url: String,
    #[serde(rename = "sseEndpoint", skip_serializing_if = "Option::is_none")]
    pub sse_endpoint: Option<String>,
}

/// External JSON document describing named stdio connections:
///
/// ```json
/// { "mcpServers": { "weather": { "command": "weather-server", "args": [] } } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StdioConnections {
    #[serde(rename = "mcpServers", default)]
    pub servers: HashMap<String, StdioConnection>,
}

impl StdioConnections {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn get(&self, name: &str) -> Option<&StdioConnection> {
        self.servers.get(name)
    }
}
