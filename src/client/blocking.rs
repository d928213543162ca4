//! Blocking facade over [`McpClient`].
//!
//! The async contract is canonical; this wrapper awaits the underlying
//! future on the supplied runtime handle and returns the result, for hosts
//! that are not async. Must not be called from within an async context.

use std::sync::Arc;
use tokio::runtime::Handle;

use super::McpClient;
use crate::error::Error;
use crate::types::*;

/// Synchronous wrapper around an [`McpClient`].
#[derive(Clone)]
pub struct McpSyncClient {
    client: Arc<McpClient>,
    handle: Handle,
}

impl McpSyncClient {
    /// Wraps `client`, running its futures on `handle`.
    pub fn new(client: Arc<McpClient>, handle: Handle) -> Self {
        Self { client, handle }
    }

    /// The wrapped async client.
    pub fn inner(&self) -> &Arc<McpClient> {
        &self.client
    }

    pub fn initialize(&self) -> Result<InitializeResult, Error> {
        self.handle.block_on(self.client.initialize())
    }

    pub fn ping(&self) -> Result<(), Error> {
        self.handle.block_on(self.client.ping())
    }

    pub fn list_tools(&self) -> Result<ListToolsResult, Error> {
        self.handle.block_on(self.client.list_tools())
    }

    pub fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResult, Error> {
        self.handle.block_on(self.client.call_tool(request))
    }

    pub fn list_resources(&self) -> Result<ListResourcesResult, Error> {
        self.handle.block_on(self.client.list_resources())
    }

    pub fn read_resource(&self, request: ReadResourceRequest) -> Result<ReadResourceResult, Error> {
        self.handle.block_on(self.client.read_resource(request))
    }

    pub fn list_resource_templates(&self) -> Result<ListResourceTemplatesResult, Error> {
        self.handle.block_on(self.client.list_resource_templates())
    }

    pub fn list_prompts(&self) -> Result<ListPromptsResult, Error> {
        self.handle.block_on(self.client.list_prompts())
    }

    pub fn get_prompt(&self, request: GetPromptRequest) -> Result<GetPromptResult, Error> {
        self.handle.block_on(self.client.get_prompt(request))
    }

    pub fn complete(&self, request: CompleteRequest) -> Result<CompleteResult, Error> {
        self.handle.block_on(self.client.complete(request))
    }

    pub fn set_logging_level(&self, level: LoggingLevel) -> Result<(), Error> {
        self.handle.block_on(self.client.set_logging_level(level))
    }

    pub fn add_root(&self, root: Root) -> Result<(), Error> {
        self.handle.block_on(self.client.add_root(root))
    }

    pub fn remove_root(&self, uri: &str) -> Result<(), Error> {
        self.handle.block_on(self.client.remove_root(uri))
    }

    pub fn close_gracefully(&self) -> Result<(), Error> {
        self.handle.block_on(self.client.close_gracefully())
    }
}
