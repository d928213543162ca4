//! # mcp-conduit
//!
//! A bidirectional implementation of the Model Context Protocol (MCP): a
//! JSON-RPC 2.0 protocol that lets language-model hosts discover and invoke
//! capabilities (tools, resources, prompts, completions, roots, sampling)
//! exposed by servers, and lets servers call back into clients for sampling
//! and root enumeration.
//!
//! ## Features
//!
//! - Symmetric session engine multiplexing concurrent requests over one
//!   transport, with per-request timeouts and graceful shutdown
//! - Initialize handshake with protocol-version negotiation and
//!   capability-gated method dispatch
//! - Stdio (child process) and HTTP+SSE transports
//! - Tool adapter wrapping host callables with JSON-Schema input contracts
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcp_conduit::client::McpClient;
//! use mcp_conduit::config::StdioConnection;
//! use mcp_conduit::transport::stdio::StdioClientTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Launch the server process and frame JSON-RPC over its pipes
//!     let connection = StdioConnection::new("my-mcp-server");
//!     let transport = Arc::new(StdioClientTransport::spawn(&connection)?);
//!
//!     // Build the client and run the initialize handshake
//!     let client = McpClient::builder(transport)
//!         .client_info("example-host", "0.1.0")
//!         .build()?;
//!     let result = client.initialize().await?;
//!     println!("connected to {}", result.server_info.name);
//!
//!     let tools = client.list_tools().await?;
//!     println!("{} tools available", tools.tools.len());
//!
//!     client.close_gracefully().await?;
//!     Ok(())
//! }
//! ```

/// Client module provides the MCP client implementation
pub mod client;
/// Configuration surface for clients, servers, and connections
pub mod config;
/// Error types and handling for the SDK
pub mod error;
/// Process management for local MCP servers
pub mod process;
/// JSON-RPC envelopes and protocol constants
pub mod protocol;
/// Server module provides the MCP server implementation
pub mod server;
pub mod session;
/// Tool adapter: host callables exposed as MCP tools
pub mod tool;
/// Transport layer implementations (stdio, HTTP+SSE)
pub mod transport;
/// MCP payload schema types
pub mod types;
/// RFC-6570 URI template matching
pub mod uri_template;

// Re-export commonly used types for convenience
pub use client::{McpClient, McpSyncClient};
pub use error::{Error, ErrorCode};
pub use protocol::{
    Message, Notification, Request, RequestId, Response, ResponseError, JSONRPC_VERSION,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
pub use server::{McpServer, ServerExchange};
pub use session::McpSession;
pub use tool::{FunctionTool, ToolContext, ToolExecutionError, ToolReturn};
pub use types::*;
