//! Tool adapter: wraps a host callable as an MCP [`Tool`] and executes
//! invocations against it.
//!
//! A callable is registered as a `{name, description, params, invoker}`
//! tuple. The adapter derives the JSON-Schema input contract from the
//! parameter descriptors, binds JSON arguments at call time, and converts
//! return values into [`CallToolResult`] content. Execution failures become
//! `CallToolResult { is_error: true }` — they are *not* JSON-RPC errors.

use base64::Engine;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error as ThisError;

use crate::error::{Error, ErrorCode};
use crate::session::McpSession;
use crate::types::{CallToolResult, Content, Tool};

pub mod schema;

pub use schema::{build_input_schema, SchemaOption, ToolParam};

/// Maximum length of a prefixed tool name; longer results keep the tail.
const MAX_TOOL_NAME_LENGTH: usize = 64;

/// Per-invocation side channel passed to every tool callable.
///
/// Carries host-supplied entries and, when the call arrives over a live
/// session, the session itself so tools can call back to the peer.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub entries: HashMap<String, Value>,
    pub session: Option<Arc<McpSession>>,
}

impl ToolContext {
    pub fn new(entries: HashMap<String, Value>) -> Self {
        Self {
            entries,
            session: None,
        }
    }

    pub fn with_session(mut self, session: Arc<McpSession>) -> Self {
        self.session = Some(session);
        self
    }
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("entries", &self.entries)
            .field("session", &self.session.as_ref().map(|s| s.id().to_string()))
            .finish()
    }
}

/// Failure raised by the callable itself; surfaces as an `is_error` result.
#[derive(Debug, ThisError)]
#[error("{0}")]
pub struct ToolExecutionError(pub String);

impl ToolExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// What a callable produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolReturn {
    /// `()`-returning callables
    Unit,
    /// Rendered image, as PNG bytes
    Image(Vec<u8>),
    /// Any serializable value
    Value(Value),
}

impl ToolReturn {
    pub fn text(value: impl Into<String>) -> Self {
        ToolReturn::Value(Value::String(value.into()))
    }
}

/// The invoker half of the callable tuple.
pub type ToolInvoker = Arc<
    dyn Fn(
            HashMap<String, Value>,
            ToolContext,
        ) -> BoxFuture<'static, Result<ToolReturn, ToolExecutionError>>
        + Send
        + Sync,
>;

/// A host callable wrapped as an invocable MCP tool.
#[derive(Clone)]
pub struct FunctionTool {
    tool: Tool,
    params: Arc<Vec<ToolParam>>,
    invoker: ToolInvoker,
    response_mime_type: Option<String>,
}

impl FunctionTool {
    pub fn builder(name: impl Into<String>) -> FunctionToolBuilder {
        FunctionToolBuilder::new(name)
    }

    /// The wire-level tool descriptor (name, description, input schema).
    pub fn tool(&self) -> &Tool {
        &self.tool
    }

    pub fn name(&self) -> &str {
        &self.tool.name
    }

    /// Invokes the callable from a raw JSON argument string.
    ///
    /// A malformed argument document is a protocol-level
    /// [`ErrorCode::InvalidParams`] failure; anything the callable itself
    /// throws comes back as a successful [`CallToolResult`] with
    /// `is_error: true`.
    pub async fn invoke_json(
        &self,
        arguments: &str,
        context: ToolContext,
    ) -> Result<CallToolResult, Error> {
        let parsed: Value = serde_json::from_str(arguments).map_err(|e| {
            Error::protocol(
                ErrorCode::InvalidParams,
                format!("Malformed tool arguments: {e}"),
            )
        })?;
        let map = match parsed {
            Value::Object(map) => map.into_iter().collect(),
            Value::Null => HashMap::new(),
            _ => {
                return Err(Error::protocol(
                    ErrorCode::InvalidParams,
                    "Tool arguments must be a JSON object",
                ));
            }
        };
        Ok(self.invoke(map, context).await)
    }

    /// Invokes the callable from an already-parsed argument map.
    pub async fn invoke(
        &self,
        arguments: HashMap<String, Value>,
        context: ToolContext,
    ) -> CallToolResult {
        for param in self.params.iter() {
            if param.context || !param.required {
                continue;
            }
            if !arguments.contains_key(&param.name) {
                return CallToolResult::error(format!(
                    "Missing required argument: {}",
                    param.name
                ));
            }
        }

        match (self.invoker)(arguments, context).await {
            Ok(value) => self.convert_return(value),
            Err(e) => {
                log::debug!("tool {} failed: {}", self.tool.name, e);
                CallToolResult::error(e.to_string())
            }
        }
    }

    fn convert_return(&self, value: ToolReturn) -> CallToolResult {
        let content = match value {
            ToolReturn::Unit => Content::text("Done"),
            ToolReturn::Image(png) => {
                let data = base64::engine::general_purpose::STANDARD.encode(png);
                match &self.response_mime_type {
                    Some(mime_type) => Content::image(data, mime_type.clone()),
                    None => Content::text(
                        serde_json::json!({"mimeType": "image/png", "data": data}).to_string(),
                    ),
                }
            }
            ToolReturn::Value(value) => match serde_json::to_string(&value) {
                Ok(text) => Content::text(text),
                Err(e) => {
                    return CallToolResult::error(format!(
                        "Failed to serialize tool result: {e}"
                    ));
                }
            },
        };
        CallToolResult::ok(vec![content])
    }
}

impl fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.tool.name)
            .field("description", &self.tool.description)
            .finish()
    }
}

/// Builder assembling the callable tuple.
pub struct FunctionToolBuilder {
    name: String,
    description: Option<String>,
    params: Vec<ToolParam>,
    schema_options: Vec<SchemaOption>,
    response_mime_type: Option<String>,
}

impl FunctionToolBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            params: Vec::new(),
            schema_options: Vec::new(),
            response_mime_type: None,
        }
    }

    /// Overrides the description; without one the tool name is de-camel-cased
    /// (`getWeather` → "get Weather").
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn param(mut self, param: ToolParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn schema_option(mut self, option: SchemaOption) -> Self {
        self.schema_options.push(option);
        self
    }

    /// Packages image returns as an `Image` content item with this mime type
    /// instead of the default JSON-in-text form.
    pub fn response_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.response_mime_type = Some(mime_type.into());
        self
    }

    pub fn handler<F, Fut>(self, handler: F) -> FunctionTool
    where
        F: Fn(HashMap<String, Value>, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<ToolReturn, ToolExecutionError>>
            + Send
            + 'static,
    {
        let description = self
            .description
            .unwrap_or_else(|| re_concatenate_camel_case(&self.name, " "));
        let input_schema = build_input_schema(&self.params, &self.schema_options);
        let invoker: ToolInvoker = Arc::new(move |args, context| Box::pin(handler(args, context)));
        FunctionTool {
            tool: Tool {
                name: self.name,
                description,
                input_schema,
            },
            params: Arc::new(self.params),
            invoker,
            response_mime_type: self.response_mime_type,
        }
    }
}

/// Splits a camelCase identifier with `delimiter` (`getWeather` → "get Weather").
pub fn re_concatenate_camel_case(input: &str, delimiter: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for (i, c) in input.chars().enumerate() {
        if c.is_uppercase() && i > 0 {
            out.push_str(delimiter);
        }
        out.push(c);
    }
    out
}

/// Joins a prefix and a tool name into a sanitized, length-bounded name.
///
/// Both parts must be non-empty. Characters outside `[a-zA-Z0-9_-]` are
/// removed, `-` becomes `_`, and only the last 64 characters are kept.
pub fn prefixed_tool_name(prefix: &str, tool_name: &str) -> Result<String, Error> {
    if prefix.trim().is_empty() || tool_name.trim().is_empty() {
        return Err(Error::Other(
            "Prefix or toolName cannot be null or empty".into(),
        ));
    }

    let input = format!("{}_{}", prefix, tool_name);
    let formatted: String = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .map(|c| if c == '-' { '_' } else { c })
        .collect();

    if formatted.len() > MAX_TOOL_NAME_LENGTH {
        Ok(formatted[formatted.len() - MAX_TOOL_NAME_LENGTH..].to_string())
    } else {
        Ok(formatted)
    }
}

/// Names appearing more than once across the given tools.
pub fn duplicate_tool_names(tools: &[FunctionTool]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for tool in tools {
        *counts.entry(tool.name()).or_insert(0) += 1;
    }
    let mut duplicates: Vec<String> = counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name.to_string())
        .collect();
    duplicates.sort();
    duplicates
}

/// Merges tool lists, deterministically keeping the first occurrence of each
/// name.
pub fn merge_keep_first(tools: Vec<FunctionTool>) -> Vec<FunctionTool> {
    let mut seen = std::collections::HashSet::new();
    tools
        .into_iter()
        .filter(|tool| seen.insert(tool.name().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool() -> FunctionTool {
        FunctionTool::builder("echo")
            .description("Echoes the message back")
            .param(ToolParam::string("msg"))
            .handler(|args, _context| async move {
                Ok(ToolReturn::Value(args["msg"].clone()))
            })
    }

    #[tokio::test]
    async fn invocation_serializes_the_return_value() {
        let tool = echo_tool();
        let result = tool
            .invoke_json(r#"{"msg": "hi"}"#, ToolContext::default())
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(false));
        assert_eq!(result.content, vec![Content::text("\"hi\"")]);
    }

    #[tokio::test]
    async fn malformed_arguments_are_invalid_params() {
        let tool = echo_tool();
        let err = tool
            .invoke_json("{not json", ToolContext::default())
            .await
            .unwrap_err();
        match err {
            Error::Protocol { code, .. } => assert_eq!(code, ErrorCode::InvalidParams),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_required_argument_fails_the_call() {
        let tool = echo_tool();
        let result = tool
            .invoke_json("{}", ToolContext::default())
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(
            result.content,
            vec![Content::text("Missing required argument: msg")]
        );
    }

    #[tokio::test]
    async fn execution_failure_is_not_a_protocol_error() {
        let tool = FunctionTool::builder("boom")
            .param(ToolParam::string("msg").optional())
            .handler(|_args, _context| async move {
                Err::<ToolReturn, _>(ToolExecutionError::new("boom"))
            });
        let result = tool
            .invoke_json("{}", ToolContext::default())
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(result.content, vec![Content::text("boom")]);
    }

    #[tokio::test]
    async fn unit_return_becomes_done() {
        let tool = FunctionTool::builder("noop")
            .handler(|_args, _context| async move { Ok(ToolReturn::Unit) });
        let result = tool.invoke(HashMap::new(), ToolContext::default()).await;
        assert_eq!(result.content, vec![Content::text("Done")]);
        assert_eq!(result.is_error, Some(false));
    }

    #[tokio::test]
    async fn image_return_defaults_to_json_text() {
        let tool = FunctionTool::builder("render")
            .handler(|_args, _context| async move { Ok(ToolReturn::Image(vec![1, 2, 3])) });
        let result = tool.invoke(HashMap::new(), ToolContext::default()).await;
        match &result.content[0] {
            Content::Text { text, .. } => {
                let value: Value = serde_json::from_str(text).unwrap();
                assert_eq!(value["mimeType"], "image/png");
                assert_eq!(value["data"], "AQID");
            }
            other => panic!("expected text content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn image_return_with_registered_mime_type() {
        let tool = FunctionTool::builder("render")
            .response_mime_type("image/png")
            .handler(|_args, _context| async move { Ok(ToolReturn::Image(vec![1, 2, 3])) });
        let result = tool.invoke(HashMap::new(), ToolContext::default()).await;
        assert_eq!(result.content, vec![Content::image("AQID", "image/png")]);
    }

    #[test]
    fn description_defaults_to_de_camel_cased_name() {
        let tool = FunctionTool::builder("getWeather")
            .handler(|_args, _context| async move { Ok(ToolReturn::Unit) });
        assert_eq!(tool.tool().description, "get Weather");
    }

    #[test]
    fn prefixed_tool_name_requires_both_parts() {
        assert!(prefixed_tool_name("", "tool").is_err());
        assert!(prefixed_tool_name("server", " ").is_err());
        assert_eq!(
            prefixed_tool_name("server", "tool").unwrap(),
            "server_tool"
        );
    }

    #[test]
    fn prefixed_tool_name_sanitizes_and_truncates() {
        assert_eq!(
            prefixed_tool_name("my-server", "get.weather!").unwrap(),
            "my_server_getweather"
        );
        let long = "x".repeat(80);
        let result = prefixed_tool_name("p", &long).unwrap();
        assert_eq!(result.len(), 64);
        assert!(result.chars().all(|c| c == 'x'));
    }

    #[test]
    fn duplicates_and_first_occurrence_merge() {
        let a = echo_tool();
        let b = FunctionTool::builder("echo")
            .description("imposter")
            .handler(|_args, _context| async move { Ok(ToolReturn::Unit) });
        let c = FunctionTool::builder("other")
            .handler(|_args, _context| async move { Ok(ToolReturn::Unit) });

        let tools = vec![a, b, c];
        assert_eq!(duplicate_tool_names(&tools), vec!["echo".to_string()]);

        let merged = merge_keep_first(tools);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].tool().description, "Echoes the message back");
        assert_eq!(merged[1].name(), "other");
    }
}
