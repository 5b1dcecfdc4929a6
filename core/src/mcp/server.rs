use crate::mcp::types::{
    Implementation, JSONRPC_VERSION, JsonRpcError, JsonRpcIncoming, JsonRpcResponse, PROTOCOL_VERSION,
};
use crate::traits::ToolSession;
use anyhow::Result;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

/// A prompt template offered through `prompts/list` and `prompts/get`.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub name: String,
    pub description: String,
    pub text: String,
}

/// Serves a [`ToolSession`] as an MCP tool server, one JSON-RPC message per
/// line. Requests are answered one at a time in arrival order.
pub struct McpServer {
    info: Implementation,
    tools: Arc<dyn ToolSession>,
    prompts: Vec<Prompt>,
}

impl McpServer {
    pub fn new(name: impl Into<String>, tools: Arc<dyn ToolSession>) -> Self {
        Self {
            info: Implementation {
                name: name.into(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            tools,
            prompts: Vec::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: Prompt) -> Self {
        self.prompts.push(prompt);
        self
    }

    pub async fn serve_stdio(&self) -> Result<()> {
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Runs until `reader` reaches end of input.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("Tool server '{}' ready", self.info.name);
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let reply = match serde_json::from_str::<JsonRpcIncoming>(line) {
                Ok(message) => self.dispatch(message).await,
                Err(e) => {
                    warn!("Unreadable request: {}", e);
                    Some(failure(Value::Null, PARSE_ERROR, format!("Parse error: {e}")))
                }
            };

            if let Some(reply) = reply {
                writer
                    .write_all(serde_json::to_string(&reply)?.as_bytes())
                    .await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
        }

        info!("Client closed its input, stopping");
        Ok(())
    }

    async fn dispatch(&self, message: JsonRpcIncoming) -> Option<JsonRpcResponse> {
        let method = message.method?;
        let Some(id) = message.id else {
            debug!("Notification: {}", method);
            return None;
        };

        let params = message.params.unwrap_or(Value::Null);
        Some(match self.handle(&method, &params).await {
            Ok(result) => JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION,
                id,
                result: Some(result),
                error: None,
            },
            Err(error) => JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION,
                id,
                result: None,
                error: Some(error),
            },
        })
    }

    async fn handle(&self, method: &str, params: &Value) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}, "prompts": {}},
                "serverInfo": self.info,
            })),
            "ping" => Ok(json!({})),
            "tools/list" => {
                let tools = self
                    .tools
                    .list_tools()
                    .await
                    .map_err(|e| rpc_error(INTERNAL_ERROR, format!("{e:#}")))?;
                let tools: Vec<Value> = tools
                    .into_iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": t.input_schema,
                        })
                    })
                    .collect();
                Ok(json!({ "tools": tools }))
            }
            "tools/call" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| rpc_error(INVALID_PARAMS, "Missing tool name".to_string()))?;
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

                info!("Calling {} with {}", name, arguments);
                // Failures are reported as tool results so the model can react.
                Ok(match self.tools.call_tool(name, arguments).await {
                    Ok(output) => json!({"content": output.content, "isError": output.is_error}),
                    Err(e) => json!({
                        "content": [{"type": "text", "text": format!("{e:#}")}],
                        "isError": true,
                    }),
                })
            }
            "prompts/list" => {
                let prompts: Vec<Value> = self
                    .prompts
                    .iter()
                    .map(|p| json!({"name": p.name, "description": p.description}))
                    .collect();
                Ok(json!({ "prompts": prompts }))
            }
            "prompts/get" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let prompt = self
                    .prompts
                    .iter()
                    .find(|p| p.name == name)
                    .ok_or_else(|| rpc_error(INVALID_PARAMS, format!("Unknown prompt: {name}")))?;
                Ok(json!({
                    "description": prompt.description,
                    "messages": [{
                        "role": "user",
                        "content": {"type": "text", "text": prompt.text},
                    }],
                }))
            }
            other => Err(rpc_error(METHOD_NOT_FOUND, format!("Method not found: {other}"))),
        }
    }
}

fn rpc_error(code: i64, message: String) -> JsonRpcError {
    JsonRpcError {
        code,
        message,
        data: None,
    }
}

fn failure(id: Value, code: i64, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION,
        id,
        result: None,
        error: Some(rpc_error(code, message)),
    }
}
