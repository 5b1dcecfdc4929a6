use crate::config::ToolServerConfig;
use crate::mcp::types::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult, JSONRPC_VERSION,
    JsonRpcIncoming, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcError, ListToolsResult,
    PROTOCOL_VERSION,
};
use crate::traits::{ToolDescriptor, ToolOutput, ToolSession};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct SessionIo {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

/// Client side of a tool server speaking MCP over the child's stdio,
/// one JSON-RPC message per line.
///
/// Exchanges are serialized through a single lock, so concurrent callers
/// never interleave frames. A response that arrives after its caller gave up
/// is skipped by id on the next exchange.
pub struct McpSession {
    name: String,
    io: Mutex<SessionIo>,
    next_id: AtomicU64,
    server_info: Option<Implementation>,
    instructions: Option<String>,
}

impl McpSession {
    /// Spawns the server and performs the `initialize` handshake.
    pub async fn connect(name: &str, config: &ToolServerConfig) -> Result<Self> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(env) = &config.env {
            command.envs(env);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to launch '{}'", config.command))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("Child stdin unavailable"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("Child stdout unavailable"))?;

        let mut session = Self {
            name: name.to_string(),
            io: Mutex::new(SessionIo {
                child,
                stdin: Some(stdin),
                stdout: BufReader::new(stdout),
            }),
            next_id: AtomicU64::new(1),
            server_info: None,
            instructions: None,
        };

        let init: InitializeResult = session
            .request(
                "initialize",
                Some(serde_json::to_value(InitializeParams {
                    protocol_version: PROTOCOL_VERSION,
                    capabilities: json!({}),
                    client_info: Implementation {
                        name: env!("CARGO_PKG_NAME").to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                })?),
            )
            .await
            .context("initialize handshake failed")?;
        session.notify("notifications/initialized", None).await?;

        if init.protocol_version != PROTOCOL_VERSION {
            debug!(
                "Tool server '{}' answered with protocol {}",
                name, init.protocol_version
            );
        }
        info!(
            "Connected to tool server '{}' ({} {})",
            name, init.server_info.name, init.server_info.version
        );
        session.server_info = Some(init.server_info);
        session.instructions = init.instructions;
        Ok(session)
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.server_info.as_ref()
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        })?;

        let mut io = self.io.lock().await;
        write_line(&mut io, &frame).await?;

        loop {
            let incoming = read_message(&mut io, &self.name).await?;

            match (&incoming.id, &incoming.method) {
                (Some(incoming_id), None) if incoming_id.as_u64() == Some(id) => {
                    if let Some(error) = incoming.error {
                        bail!("{} error {}: {}", method, error.code, error.message);
                    }
                    let result = incoming.result.unwrap_or(Value::Null);
                    return serde_json::from_value(result)
                        .with_context(|| format!("Malformed {} result", method));
                }
                (Some(request_id), Some(server_method)) => {
                    self.answer_server_request(&mut io, request_id.clone(), server_method)
                        .await?;
                }
                (None, Some(notification)) => {
                    debug!("'{}' notification: {}", self.name, notification);
                }
                // A null id means the server could not read our request.
                (None, None) if incoming.error.is_some() => {
                    if let Some(error) = incoming.error {
                        bail!("{} error {}: {}", method, error.code, error.message);
                    }
                }
                _ => {
                    debug!("'{}' skipping stale response {:?}", self.name, incoming.id);
                }
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = serde_json::to_string(&JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        })?;
        let mut io = self.io.lock().await;
        write_line(&mut io, &frame).await
    }

    async fn answer_server_request(&self, io: &mut SessionIo, id: Value, method: &str) -> Result<()> {
        let response = if method == "ping" {
            JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION,
                id,
                result: Some(json!({})),
                error: None,
            }
        } else {
            debug!("'{}' sent unsupported request {}", self.name, method);
            JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION,
                id,
                result: None,
                error: Some(JsonRpcError {
                    code: -32601,
                    message: format!("Method not found: {method}"),
                    data: None,
                }),
            }
        };
        write_line(io, &serde_json::to_string(&response)?).await
    }
}

async fn write_line(io: &mut SessionIo, frame: &str) -> Result<()> {
    let stdin = io
        .stdin
        .as_mut()
        .ok_or_else(|| anyhow!("Tool server session is closed"))?;
    stdin.write_all(frame.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    Ok(())
}

async fn read_message(io: &mut SessionIo, name: &str) -> Result<JsonRpcIncoming> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = io
            .stdout
            .read_line(&mut line)
            .await
            .with_context(|| format!("Failed to read from tool server '{}'", name))?;
        if n == 0 {
            bail!("Tool server '{}' closed its output", name);
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str(trimmed) {
            Ok(message) => return Ok(message),
            Err(_) => debug!("'{}' non-protocol output: {}", name, trimmed),
        }
    }
}

#[async_trait]
impl ToolSession for McpSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ListToolsResult = self.request("tools/list", params).await?;
            tools.extend(page.tools.into_iter().map(|t| ToolDescriptor {
                name: t.name,
                description: t.description.unwrap_or_default(),
                input_schema: t.input_schema,
            }));

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let result: CallToolResult = self
            .request(
                "tools/call",
                Some(serde_json::to_value(CallToolParams { name, arguments })?),
            )
            .await?;

        Ok(ToolOutput {
            content: result.content,
            is_error: result.is_error,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        drop(io.stdin.take());

        match tokio::time::timeout(SHUTDOWN_GRACE, io.child.wait()).await {
            Ok(status) => {
                debug!("Tool server '{}' exited: {:?}", self.name, status?);
            }
            Err(_) => {
                warn!("Tool server '{}' did not exit, killing it", self.name);
                io.child.kill().await?;
            }
        }
        Ok(())
    }
}
