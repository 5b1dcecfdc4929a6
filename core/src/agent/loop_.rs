use crate::agent::{ToolRegistry, Transcript};
use crate::error::{TurnError, TurnResult};
use crate::traits::{ContentBlock, Message, Model, ModelRequest, ModelResponse, ToolDescriptor, ToolOutput, ToolSession};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, field, info, info_span, warn};

pub const DEFAULT_MAX_TOKENS: u32 = 2024;
pub const DEFAULT_MAX_TURNS: usize = 10;
const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Drives one user turn: model call, tool round-trips, final answer.
pub struct AgentLoop {
    model: Arc<dyn Model>,
    tool_registry: Arc<ToolRegistry>,
    system_prompt: Option<String>,
    max_tokens: u32,
    max_turns: usize,
    model_timeout: Duration,
    tool_timeout: Duration,
}

struct PendingCall<'a> {
    id: &'a str,
    name: &'a str,
    input: &'a Value,
    session: Arc<dyn ToolSession>,
}

impl AgentLoop {
    pub fn new(model: Arc<dyn Model>, tool_registry: Arc<ToolRegistry>) -> Self {
        Self {
            model,
            tool_registry,
            system_prompt: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_turns: DEFAULT_MAX_TURNS,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    /// Maximum number of tool rounds in one turn.
    pub fn with_max_turns(mut self, max: usize) -> Self {
        self.max_turns = max;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.tool_registry
    }

    pub async fn process(&self, query: &str) -> TurnResult<String> {
        self.process_with_cancel(query, &CancellationToken::new())
            .await
    }

    #[tracing::instrument(name = "process_query", skip_all)]
    pub async fn process_with_cancel(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> TurnResult<String> {
        let tools = self.tool_registry.descriptors();
        let mut transcript = Transcript::new(Message::user(query));
        let mut response = self.call_model(&transcript, &tools, cancel).await?;
        let mut rounds = 0;

        loop {
            if let Some(text) = response.final_text() {
                info!("{}", text);
                return Ok(text.to_string());
            }

            if !response.has_tool_use() {
                return Err(TurnError::StalledResponse {
                    blocks: response.content.len(),
                });
            }

            if rounds >= self.max_turns {
                return Err(TurnError::TurnLimitExceeded {
                    limit: self.max_turns,
                });
            }
            rounds += 1;

            let blocks = response.content;
            let calls = self.resolve_calls(&blocks)?;
            transcript.push(Message::assistant(blocks.clone()));

            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                let output = self.call_tool(&call, cancel).await?;
                results.push(ContentBlock::ToolResult {
                    tool_use_id: call.id.to_string(),
                    content: output.content,
                    is_error: output.is_error.then_some(true),
                });
            }
            transcript.push(Message::tool_results(results));

            response = self.call_model(&transcript, &tools, cancel).await?;
        }
    }

    /// Resolves every tool use of a response up front so an unknown name
    /// fails the turn before any provider is touched.
    fn resolve_calls<'a>(&self, blocks: &'a [ContentBlock]) -> TurnResult<Vec<PendingCall<'a>>> {
        let mut calls = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::Text { text } => info!("{}", text),
                ContentBlock::ToolUse { id, name, input } => {
                    let session = self.tool_registry.resolve(name)?;
                    calls.push(PendingCall {
                        id,
                        name,
                        input,
                        session,
                    });
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    warn!("Ignoring tool result '{}' emitted by the model", tool_use_id);
                }
            }
        }
        Ok(calls)
    }

    async fn call_model(
        &self,
        transcript: &Transcript,
        tools: &[ToolDescriptor],
        cancel: &CancellationToken,
    ) -> TurnResult<ModelResponse> {
        let span = info_span!(
            "llm_call",
            llm.model_name = self.model.model_id(),
            llm.provider = self.model.provider(),
            llm.input = field::Empty,
            llm.output = field::Empty,
            llm.token_count.prompt = field::Empty,
            llm.token_count.completion = field::Empty,
            llm.token_count.total = field::Empty,
        );
        if let Some(last) = transcript.last() {
            span.record("llm.input", last.summary().as_str());
        }

        let request = ModelRequest {
            system: self.system_prompt.as_deref(),
            messages: transcript.messages(),
            tools,
            max_tokens: self.max_tokens,
        };

        let response = async {
            tokio::select! {
                _ = cancel.cancelled() => Err(TurnError::Cancelled),
                result = tokio::time::timeout(self.model_timeout, self.model.create_message(request)) => {
                    match result {
                        Ok(Ok(response)) => Ok(response),
                        Ok(Err(e)) => Err(TurnError::ModelCall(e)),
                        Err(_) => Err(TurnError::ModelTimeout(self.model_timeout)),
                    }
                }
            }
        }
        .instrument(span.clone())
        .await?;

        if let Some(text) = response.content.iter().find_map(ContentBlock::as_text) {
            span.record("llm.output", text);
        }
        span.record("llm.token_count.prompt", response.usage.input_tokens);
        span.record("llm.token_count.completion", response.usage.output_tokens);
        span.record("llm.token_count.total", response.usage.total());

        Ok(response)
    }

    async fn call_tool(
        &self,
        call: &PendingCall<'_>,
        cancel: &CancellationToken,
    ) -> TurnResult<ToolOutput> {
        let span = info_span!(
            "tool_call",
            tool.name = call.name,
            tool.arguments = %call.input,
            tool.output = field::Empty,
        );
        info!("Calling tool {} with args {}", call.name, call.input);

        let output = async {
            tokio::select! {
                _ = cancel.cancelled() => Err(TurnError::Cancelled),
                result = tokio::time::timeout(
                    self.tool_timeout,
                    call.session.call_tool(call.name, call.input.clone()),
                ) => {
                    match result {
                        Ok(Ok(output)) => Ok(output),
                        Ok(Err(source)) => Err(TurnError::ToolInvocation {
                            tool: call.name.to_string(),
                            source,
                        }),
                        Err(_) => Err(TurnError::ToolTimeout {
                            tool: call.name.to_string(),
                            timeout: self.tool_timeout,
                        }),
                    }
                }
            }
        }
        .instrument(span.clone())
        .await?;

        span.record("tool.output", output.content.to_string().as_str());
        Ok(output)
    }
}
