//! End-to-end client/server scenarios over in-process duplex pipes using the
//! line-delimited stdio framing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use mcp_conduit::client::{McpClient, McpClientBuilder};
use mcp_conduit::error::{Error, ErrorCode};
use mcp_conduit::server::{McpServer, McpServerBuilder, ServerExchange};
use mcp_conduit::session::McpSession;
use mcp_conduit::tool::{FunctionTool, ToolExecutionError, ToolParam, ToolReturn};
use mcp_conduit::transport::stdio::{StdioServerTransportProvider, StreamTransport};
use mcp_conduit::transport::Transport;
use mcp_conduit::types::*;
use mcp_conduit::LATEST_PROTOCOL_VERSION;

struct Harness {
    server: Arc<McpServer>,
    server_session: Arc<McpSession>,
    client: Arc<McpClient>,
}

/// Wires a server and a client to the two ends of an in-process pipe.
async fn connect(
    configure_server: impl FnOnce(McpServerBuilder) -> McpServerBuilder,
    configure_client: impl FnOnce(McpClientBuilder) -> McpClientBuilder,
) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);

    let provider = Arc::new(StdioServerTransportProvider::new());
    let server = configure_server(McpServer::builder(provider.clone()))
        .server_info("test-server", "1.0.0")
        .build()
        .expect("server builds");
    let server_transport: Arc<dyn Transport> =
        Arc::new(StreamTransport::from_io(server_read, server_write));
    let server_session = provider
        .serve_transport(server_transport)
        .expect("session factory installed");

    let client_transport: Arc<dyn Transport> =
        Arc::new(StreamTransport::from_io(client_read, client_write));
    let client = configure_client(McpClient::builder(client_transport))
        .client_info("test-client", "1.0.0")
        .build()
        .expect("client builds");

    Harness {
        server,
        server_session,
        client,
    }
}

fn echo_tool() -> FunctionTool {
    FunctionTool::builder("echo")
        .description("Echoes the message back")
        .param(ToolParam::string("msg"))
        .handler(|args, _context| async move { Ok(ToolReturn::Value(args["msg"].clone())) })
}

#[tokio::test]
async fn tool_roundtrip() {
    let harness = connect(
        |server| {
            server
                .capabilities(ServerCapabilities::default().with_tools(false))
                .tool(echo_tool())
        },
        |client| client,
    )
    .await;

    let init = harness.client.initialize().await.unwrap();
    assert_eq!(init.server_info.name, "test-server");
    assert!(init.capabilities.tools.is_some());

    let tools = harness.client.list_tools().await.unwrap();
    assert_eq!(tools.tools.len(), 1);
    assert_eq!(tools.tools[0].name, "echo");
    assert_eq!(
        tools.tools[0].input_schema["properties"]["msg"]["type"],
        "string"
    );
    assert_eq!(tools.tools[0].input_schema["required"], json!(["msg"]));

    let result = harness
        .client
        .call_tool(CallToolRequest {
            name: "echo".into(),
            arguments: Some(HashMap::from([("msg".to_string(), json!("hi"))])),
        })
        .await
        .unwrap();
    assert_eq!(result.is_error, Some(false));
    assert_eq!(result.content, vec![Content::text("\"hi\"")]);
}

#[tokio::test]
async fn tool_failure_is_a_successful_response_with_is_error() {
    let boom = FunctionTool::builder("boom")
        .description("Always fails")
        .handler(|_args, _context| async move {
            Err::<ToolReturn, _>(ToolExecutionError::new("boom"))
        });
    let harness = connect(
        |server| {
            server
                .capabilities(ServerCapabilities::default().with_tools(false))
                .tool(boom)
        },
        |client| client,
    )
    .await;

    harness.client.initialize().await.unwrap();
    // The call itself succeeds at the JSON-RPC level.
    let result = harness
        .client
        .call_tool(CallToolRequest {
            name: "boom".into(),
            arguments: None,
        })
        .await
        .unwrap();
    assert_eq!(result.is_error, Some(true));
    assert_eq!(result.content, vec![Content::text("boom")]);
}

#[tokio::test]
async fn calling_an_unregistered_capability_is_method_not_found() {
    let harness = connect(|server| server, |client| client).await;
    harness.client.initialize().await.unwrap();

    let err = harness.client.list_tools().await.unwrap_err();
    match err {
        Error::Protocol { code, .. } => assert_eq!(code, ErrorCode::MethodNotFound),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn roots_list_without_capability_reports_the_reason() {
    let harness = connect(|server| server, |client| client).await;
    harness.client.initialize().await.unwrap();

    let exchange = ServerExchange::new(harness.server_session.clone());
    let err = exchange.list_roots().await.unwrap_err();
    match err {
        Error::Protocol {
            code,
            message,
            data,
        } => {
            assert_eq!(code, ErrorCode::MethodNotFound);
            assert_eq!(message, "Roots not supported");
            assert_eq!(
                data.unwrap()["reason"],
                "Client does not have roots capability"
            );
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn unknown_protocol_version_negotiates_to_the_servers_latest() {
    let harness = connect(
        |server| server,
        |client| client.protocol_version("1999-01-01"),
    )
    .await;

    let result = harness.client.initialize().await.unwrap();
    assert_eq!(result.protocol_version, LATEST_PROTOCOL_VERSION);
    assert_eq!(
        harness.client.negotiated_version().unwrap(),
        LATEST_PROTOCOL_VERSION
    );
}

#[tokio::test]
async fn supported_protocol_version_is_echoed() {
    let harness = connect(|server| server, |client| client).await;
    let result = harness.client.initialize().await.unwrap();
    assert_eq!(result.protocol_version, LATEST_PROTOCOL_VERSION);
}

#[tokio::test]
async fn request_times_out_when_the_peer_never_responds() {
    // A lone transport with nobody on the other end.
    let (client_io, _server_io) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_io);
    let transport: Arc<dyn Transport> =
        Arc::new(StreamTransport::from_io(client_read, client_write));
    let client = McpClient::builder(transport)
        .request_timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    let err = client.initialize().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

#[tokio::test]
async fn resources_resolve_through_templates() {
    let read_handler: mcp_conduit::server::ResourceReadHandler =
        Arc::new(|_exchange, request| {
            Box::pin(async move {
                Ok(ReadResourceResult {
                    contents: vec![ResourceContents::Text {
                        uri: request.uri.clone(),
                        mime_type: Some("text/plain".into()),
                        text: format!("contents of {}", request.uri),
                    }],
                })
            })
        });
    let harness = connect(
        |server| {
            server
                .capabilities(ServerCapabilities::default().with_resources(false, false))
                .resource(
                    Resource {
                        uri: "db://tables/{table}".into(),
                        name: "table".into(),
                        description: None,
                        mime_type: None,
                        annotations: None,
                    },
                    read_handler,
                )
        },
        |client| client,
    )
    .await;
    harness.client.initialize().await.unwrap();

    let listed = harness.client.list_resources().await.unwrap();
    assert_eq!(listed.resources[0].uri, "db://tables/{table}");

    let templates = harness.client.list_resource_templates().await.unwrap();
    assert_eq!(
        templates.resource_templates[0].uri_template,
        "db://tables/{table}"
    );

    let read = harness
        .client
        .read_resource(ReadResourceRequest {
            uri: "db://tables/users".into(),
        })
        .await
        .unwrap();
    match &read.contents[0] {
        ResourceContents::Text { uri, text, .. } => {
            assert_eq!(uri, "db://tables/users");
            assert_eq!(text, "contents of db://tables/users");
        }
        other => panic!("expected text contents, got {other:?}"),
    }

    // No registered URI matches under RFC-6570 expansion.
    let err = harness
        .client
        .read_resource(ReadResourceRequest {
            uri: "files://other".into(),
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Resource not found"));
}

#[tokio::test]
async fn prompt_arguments_are_validated_against_the_declaration() {
    let handler: mcp_conduit::server::PromptHandler = Arc::new(|_exchange, request| {
        Box::pin(async move {
            let language = request
                .arguments
                .as_ref()
                .and_then(|a| a.get("language"))
                .cloned()
                .unwrap_or(Value::Null);
            Ok(GetPromptResult {
                description: Some("review".into()),
                messages: vec![PromptMessage {
                    role: Role::User,
                    content: Content::text(format!("review some {language} code")),
                }],
            })
        })
    });
    let harness = connect(
        |server| {
            server
                .capabilities(ServerCapabilities::default().with_prompts(false))
                .prompt(
                    Prompt {
                        name: "code_review".into(),
                        description: None,
                        arguments: vec![PromptArgument {
                            name: "language".into(),
                            description: None,
                            required: Some(true),
                        }],
                    },
                    handler,
                )
        },
        |client| client,
    )
    .await;
    harness.client.initialize().await.unwrap();

    let prompts = harness.client.list_prompts().await.unwrap();
    assert_eq!(prompts.prompts[0].name, "code_review");

    let result = harness
        .client
        .get_prompt(GetPromptRequest {
            name: "code_review".into(),
            arguments: Some(HashMap::from([("language".to_string(), json!("rust"))])),
        })
        .await
        .unwrap();
    assert_eq!(result.messages.len(), 1);

    let err = harness
        .client
        .get_prompt(GetPromptRequest {
            name: "code_review".into(),
            arguments: Some(HashMap::from([("framework".to_string(), json!("axum"))])),
        })
        .await
        .unwrap_err();
    match err {
        Error::Protocol { code, .. } => assert_eq!(code, ErrorCode::InvalidParams),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn completion_round_trip() {
    let prompt_handler: mcp_conduit::server::PromptHandler = Arc::new(|_exchange, _request| {
        Box::pin(async {
            Ok(GetPromptResult {
                description: None,
                messages: vec![],
            })
        })
    });
    let completion_handler: mcp_conduit::server::CompletionHandler =
        Arc::new(|_exchange, request| {
            Box::pin(async move {
                let values = ["python", "rust", "go"]
                    .iter()
                    .filter(|v| v.starts_with(&request.argument.value))
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>();
                Ok(CompleteResult {
                    completion: Completion {
                        total: Some(values.len() as u64),
                        has_more: Some(false),
                        values,
                    },
                })
            })
        });
    let harness = connect(
        |server| {
            server
                .capabilities(
                    ServerCapabilities::default()
                        .with_prompts(false)
                        .with_completions(),
                )
                .prompt(
                    Prompt {
                        name: "code_review".into(),
                        description: None,
                        arguments: vec![PromptArgument {
                            name: "language".into(),
                            description: None,
                            required: Some(true),
                        }],
                    },
                    prompt_handler,
                )
                .completion(
                    CompleteReference::Prompt {
                        name: "code_review".into(),
                    },
                    completion_handler,
                )
        },
        |client| client,
    )
    .await;
    harness.client.initialize().await.unwrap();

    let result = harness
        .client
        .complete(CompleteRequest {
            reference: CompleteReference::Prompt {
                name: "code_review".into(),
            },
            argument: CompleteArgument {
                name: "language".into(),
                value: "r".into(),
            },
        })
        .await
        .unwrap();
    assert_eq!(result.completion.values, vec!["rust".to_string()]);

    // Unknown argument names are rejected before the handler runs.
    let err = harness
        .client
        .complete(CompleteRequest {
            reference: CompleteReference::Prompt {
                name: "code_review".into(),
            },
            argument: CompleteArgument {
                name: "framework".into(),
                value: "a".into(),
            },
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Argument not found"));
}

#[tokio::test]
async fn roots_round_trip_with_cache_and_change_notification() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Vec<Root>>();
    let consumer: mcp_conduit::server::RootsChangeConsumer = Arc::new(move |_exchange, roots| {
        let seen_tx = seen_tx.clone();
        Box::pin(async move {
            let _ = seen_tx.send(roots);
        })
    });

    let harness = connect(
        |server| server.roots_change_consumer(consumer),
        |client| {
            client
                .capabilities(ClientCapabilities::default().with_roots(true))
                .root(Root {
                    uri: "file:///workspace".into(),
                    name: Some("workspace".into()),
                })
        },
    )
    .await;
    harness.client.initialize().await.unwrap();

    let exchange = ServerExchange::new(harness.server_session.clone());
    let roots = exchange.list_roots().await.unwrap();
    assert_eq!(roots.roots.len(), 1);
    assert_eq!(roots.roots[0].uri, "file:///workspace");

    // Adding a root broadcasts the change; the server re-fetches and feeds
    // its consumers the updated list.
    harness
        .client
        .add_root(Root {
            uri: "file:///second".into(),
            name: None,
        })
        .await
        .unwrap();

    let updated = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("consumer invoked")
        .unwrap();
    assert_eq!(updated.len(), 2);

    // The cache was refreshed by the notification handling.
    let roots = exchange.list_roots().await.unwrap();
    assert_eq!(roots.roots.len(), 2);
}

#[tokio::test]
async fn sampling_request_reaches_the_client_handler() {
    let sampling: mcp_conduit::client::SamplingHandler = Arc::new(|request| {
        Box::pin(async move {
            Ok(CreateMessageResult {
                role: Role::Assistant,
                content: Content::text(format!(
                    "echo: {}",
                    match &request.messages[0].content {
                        Content::Text { text, .. } => text.clone(),
                        _ => String::new(),
                    }
                )),
                model: "test-model".into(),
                stop_reason: Some(StopReason::EndTurn),
            })
        })
    });
    let harness = connect(
        |server| server,
        |client| {
            client
                .capabilities(ClientCapabilities::default().with_sampling())
                .sampling_handler(sampling)
        },
    )
    .await;
    harness.client.initialize().await.unwrap();

    let exchange = ServerExchange::new(harness.server_session.clone());
    let result = exchange
        .create_message(CreateMessageRequest {
            messages: vec![SamplingMessage {
                role: Role::User,
                content: Content::text("hello"),
            }],
            model_preferences: None,
            system_prompt: None,
            include_context: None,
            temperature: None,
            max_tokens: 64,
            stop_sequences: None,
            metadata: None,
        })
        .await
        .unwrap();
    assert_eq!(result.model, "test-model");
    assert_eq!(result.content, Content::text("echo: hello"));
}

#[tokio::test]
async fn logging_respects_the_session_minimum_level() {
    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<LoggingMessageNotification>();
    let consumer: mcp_conduit::client::LoggingConsumer = Arc::new(move |notification| {
        let log_tx = log_tx.clone();
        Box::pin(async move {
            let _ = log_tx.send(notification);
        })
    });
    let harness = connect(
        |server| server.capabilities(ServerCapabilities::default().with_logging()),
        |client| client.on_log_message(consumer),
    )
    .await;
    harness.client.initialize().await.unwrap();
    harness
        .client
        .set_logging_level(LoggingLevel::Warning)
        .await
        .unwrap();

    let exchange = ServerExchange::new(harness.server_session.clone());
    exchange
        .logging_notification(LoggingMessageNotification {
            level: LoggingLevel::Debug,
            logger: Some("test".into()),
            data: json!("dropped"),
        })
        .await
        .unwrap();
    exchange
        .logging_notification(LoggingMessageNotification {
            level: LoggingLevel::Error,
            logger: Some("test".into()),
            data: json!("delivered"),
        })
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), log_rx.recv())
        .await
        .expect("log record delivered")
        .unwrap();
    assert_eq!(received.level, LoggingLevel::Error);
    assert_eq!(received.data, json!("delivered"));
    assert!(log_rx.try_recv().is_err());
}

#[tokio::test]
async fn tool_list_changed_notification_reaches_the_client() {
    let (changed_tx, mut changed_rx) = mpsc::unbounded_channel::<Vec<Tool>>();
    let consumer: mcp_conduit::client::ToolsChangeConsumer = Arc::new(move |tools| {
        let changed_tx = changed_tx.clone();
        Box::pin(async move {
            let _ = changed_tx.send(tools);
        })
    });
    let harness = connect(
        |server| server.capabilities(ServerCapabilities::default().with_tools(true)),
        |client| client.on_tools_changed(consumer),
    )
    .await;
    harness.client.initialize().await.unwrap();

    harness.server.add_tool(echo_tool()).await.unwrap();

    let tools = tokio::time::timeout(Duration::from_secs(5), changed_rx.recv())
        .await
        .expect("change consumer invoked")
        .unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
}

#[tokio::test]
async fn ping_works_in_both_directions() {
    let harness = connect(|server| server, |client| client).await;
    harness.client.initialize().await.unwrap();

    harness.client.ping().await.unwrap();
    let exchange = ServerExchange::new(harness.server_session.clone());
    exchange.ping().await.unwrap();
}

#[tokio::test]
async fn idempotent_lists_are_stable_between_calls() {
    let harness = connect(
        |server| {
            server
                .capabilities(ServerCapabilities::default().with_tools(false))
                .tool(echo_tool())
        },
        |client| client,
    )
    .await;
    harness.client.initialize().await.unwrap();

    let first = harness.client.list_tools().await.unwrap();
    let second = harness.client.list_tools().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn notifications_produce_no_response_or_state_change() {
    let seen = Arc::new(Mutex::new(0usize));
    let seen_clone = seen.clone();
    let consumer: mcp_conduit::server::RootsChangeConsumer = Arc::new(move |_exchange, _roots| {
        let seen = seen_clone.clone();
        Box::pin(async move {
            *seen.lock().unwrap() += 1;
        })
    });
    let harness = connect(
        |server| server.roots_change_consumer(consumer),
        |client| {
            client
                .capabilities(ClientCapabilities::default().with_roots(true))
                .root(Root {
                    uri: "file:///workspace".into(),
                    name: None,
                })
        },
    )
    .await;
    harness.client.initialize().await.unwrap();

    // Re-sending the same notification is permitted; only the consumer side
    // effect is observable.
    for i in 0..2 {
        harness
            .client
            .add_root(Root {
                uri: format!("file:///r{i}"),
                name: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(*seen.lock().unwrap() >= 2);
}
