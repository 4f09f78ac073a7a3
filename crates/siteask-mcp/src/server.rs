//! MCP server implementation

use crate::protocol::*;
use crate::{resources, tools};
use anyhow::Result;
use siteask_core::{Coordinator, CorpusStore};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

pub struct McpServer {
    coordinator: Arc<Coordinator>,
    corpus: Arc<CorpusStore>,
}

impl McpServer {
    pub fn new(coordinator: Arc<Coordinator>, corpus: Arc<CorpusStore>) -> Self {
        Self {
            coordinator,
            corpus,
        }
    }

    /// Serve newline-delimited JSON-RPC on stdin/stdout
    pub async fn run(&self) -> Result<()> {
        let reader = BufReader::new(tokio::io::stdin());
        let writer = BufWriter::new(tokio::io::stdout());
        self.serve(reader, writer).await
    }

    /// Serve until the reader is exhausted
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    let response =
                        JsonRpcResponse::error(None, PARSE_ERROR, &format!("Parse error: {}", e));
                    write_response(&mut writer, &response).await?;
                    continue;
                }
            };

            if request.is_notification() {
                tracing::debug!("Notification {}", request.method);
                continue;
            }

            let response = self.handle_request(&request).await;
            write_response(&mut writer, &response).await?;
        }

        Ok(())
    }

    pub async fn handle_request(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            "initialize" => self.handle_initialize(request),
            "ping" => JsonRpcResponse::success(request.id.clone(), serde_json::json!({})),
            "tools/list" => self.handle_tools_list(request),
            "tools/call" => self.handle_tools_call(request).await,
            "resources/list" => JsonRpcResponse::success(
                request.id.clone(),
                serde_json::json!({ "resources": [] }),
            ),
            "resources/templates/list" => self.handle_resource_templates(request),
            "resources/read" => self.handle_resources_read(request),
            _ => JsonRpcResponse::error(
                request.id.clone(),
                METHOD_NOT_FOUND,
                &format!("Method not found: {}", request.method),
            ),
        }
    }

    fn handle_initialize(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let result = serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": {},
                "resources": { "subscribe": false }
            },
            "serverInfo": {
                "name": "siteask",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        JsonRpcResponse::success(request.id.clone(), result)
    }

    fn handle_tools_list(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let tools = vec![
            tools::ask_tool_definition(),
            tools::list_sites_tool_definition(),
        ];

        JsonRpcResponse::success(request.id.clone(), serde_json::json!({ "tools": tools }))
    }

    async fn handle_tools_call(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let name = request
            .params
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let arguments = request
            .params
            .get("arguments")
            .cloned()
            .unwrap_or(serde_json::json!({}));

        let result = match name {
            "ask" => tools::handle_ask(&self.coordinator, arguments).await,
            "list_sites" => tools::handle_list_sites(&self.corpus).await,
            _ => Err(anyhow::anyhow!("Unknown tool: {}", name)),
        };

        let tool_result = result.unwrap_or_else(|e| {
            tracing::warn!("Tool {} failed: {}", name, e);
            ToolResult::error(format!("Error: {}", e))
        });
        match serde_json::to_value(tool_result) {
            Ok(value) => JsonRpcResponse::success(request.id.clone(), value),
            Err(e) => JsonRpcResponse::error(request.id.clone(), INVALID_PARAMS, &e.to_string()),
        }
    }

    fn handle_resource_templates(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let templates = serde_json::json!([{
            "uriTemplate": format!("{}{{url}}", resources::ITEM_URI_PREFIX),
            "name": "Corpus item",
            "description": "The stored structured record of an item, by its URL",
            "mimeType": "application/ld+json"
        }]);
        JsonRpcResponse::success(
            request.id.clone(),
            serde_json::json!({ "resourceTemplates": templates }),
        )
    }

    fn handle_resources_read(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let Some(uri) = request.params.get("uri").and_then(|v| v.as_str()) else {
            return JsonRpcResponse::error(request.id.clone(), INVALID_PARAMS, "Missing uri");
        };
        match resources::read_resource(&self.corpus, uri) {
            Ok(content) => JsonRpcResponse::success(
                request.id.clone(),
                serde_json::json!({ "contents": [content] }),
            ),
            Err(e) => JsonRpcResponse::error(request.id.clone(), INVALID_PARAMS, &e.to_string()),
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &JsonRpcResponse,
) -> Result<()> {
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

pub async fn start_server(coordinator: Arc<Coordinator>, corpus: Arc<CorpusStore>) -> Result<()> {
    let server = McpServer::new(coordinator, corpus);
    server.run().await
}
