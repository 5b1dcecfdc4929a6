use crate::traits::{ContentBlock, Message, MessageContent, Model, ModelRequest, ModelResponse, Role, ToolDescriptor, Usage};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool<'a>>>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAIMessage {
    fn text(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAIToolCallRequest {
    id: String,
    r#type: &'static str,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAITool<'a> {
    r#type: &'static str,
    function: OpenAIToolFunction<'a>,
}

#[derive(Debug, Serialize)]
struct OpenAIToolFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAIToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCall {
    id: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIFunction {
    name: String,
    arguments: String,
}

/// OpenAI-compatible chat completions endpoint (OpenAI, OpenRouter, Ollama).
/// Content blocks are mapped onto `tool_calls` and `tool` role messages.
pub struct OpenAIModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAIModel {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key: api_key.into(),
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn convert_messages(&self, system: Option<&str>, messages: &[Message]) -> Vec<OpenAIMessage> {
        let mut converted = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system {
            converted.push(OpenAIMessage::text("system", system));
        }

        for message in messages {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };

            let blocks = match &message.content {
                MessageContent::Text(text) => {
                    converted.push(OpenAIMessage::text(role, text.as_str()));
                    continue;
                }
                MessageContent::Blocks(blocks) => blocks,
            };

            let mut text = Vec::new();
            let mut tool_calls = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text: t } => text.push(t.as_str()),
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(OpenAIToolCallRequest {
                            id: id.clone(),
                            r#type: "function",
                            function: OpenAIFunction {
                                name: name.clone(),
                                arguments: input.to_string(),
                            },
                        })
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => converted.push(OpenAIMessage {
                        role: "tool",
                        content: Some(tool_result_text(content)),
                        tool_calls: None,
                        tool_call_id: Some(tool_use_id.clone()),
                    }),
                }
            }

            if !tool_calls.is_empty() {
                converted.push(OpenAIMessage {
                    role,
                    content: (!text.is_empty()).then(|| text.join("\n")),
                    tool_calls: Some(tool_calls),
                    tool_call_id: None,
                });
            } else if !text.is_empty() {
                converted.push(OpenAIMessage::text(role, text.join("\n")));
            }
        }

        converted
    }

    fn convert_tools<'a>(&self, tools: &'a [ToolDescriptor]) -> Vec<OpenAITool<'a>> {
        tools
            .iter()
            .map(|t| OpenAITool {
                r#type: "function",
                function: OpenAIToolFunction {
                    name: &t.name,
                    description: &t.description,
                    parameters: &t.input_schema,
                },
            })
            .collect()
    }
}

/// Tool messages carry plain text; MCP text content is unwrapped, anything
/// else is sent as JSON.
fn tool_result_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => {
            let texts: Option<Vec<&str>> = items
                .iter()
                .map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect();
            match texts {
                Some(texts) => texts.join("\n"),
                None => content.to_string(),
            }
        }
        other => other.to_string(),
    }
}

#[async_trait]
impl Model for OpenAIModel {
    fn provider(&self) -> &str {
        "openai"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn create_message(&self, request: ModelRequest<'_>) -> anyhow::Result<ModelResponse> {
        let openai_request = OpenAIRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            messages: self.convert_messages(request.system, request.messages),
            tools: (!request.tools.is_empty()).then(|| self.convert_tools(request.tools)),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&openai_request)
            .send()
            .await
            .context("Failed to reach OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "OpenAI API error {}: {}",
                status,
                error_text
            ));
        }

        let openai_response: OpenAIResponse = response
            .json()
            .await
            .context("Failed to decode OpenAI response")?;

        let choice = openai_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No choices in response"))?;

        let tool_calls = choice.message.tool_calls.unwrap_or_default();
        let mut content = Vec::new();
        // An empty answer is still an answer; it is only dropped next to tool calls.
        let text = choice.message.content.unwrap_or_default();
        if tool_calls.is_empty() || !text.trim().is_empty() {
            content.push(ContentBlock::Text { text });
        }
        for call in tool_calls {
            let input = if call.function.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&call.function.arguments).with_context(|| {
                    format!("Failed to parse tool arguments for {}", call.function.name)
                })?
            };
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }

        let usage = openai_response
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ModelResponse {
            content,
            usage,
            stop_reason: choice.finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn tool_round_maps_to_tool_calls_and_tool_messages() {
        let model = OpenAIModel::new("key");
        let messages = vec![
            Message::user("list tables"),
            Message::assistant(vec![ContentBlock::tool_use("call_1", "get_tables", json!({}))]),
            Message::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: "call_1".into(),
                content: json!([{"type": "text", "text": "{\"tables\": [\"orders\"]}"}]),
                is_error: None,
            }]),
        ];

        let converted = serde_json::to_value(model.convert_messages(Some("be brief"), &messages)).unwrap();
        assert_eq!(
            converted,
            json!([
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "list tables"},
                {"role": "assistant", "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "get_tables", "arguments": "{}"}}
                ]},
                {"role": "tool", "content": "{\"tables\": [\"orders\"]}", "tool_call_id": "call_1"}
            ])
        );
    }

    #[tokio::test]
    async fn tool_calls_become_tool_use_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer key"))
            .and(body_partial_json(json!({"model": "gpt-4o"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_9",
                            "type": "function",
                            "function": {"name": "get_schema", "arguments": "{\"table_name\":\"orders\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 5, "completion_tokens": 7}
            })))
            .mount(&server)
            .await;

        let model = OpenAIModel::new("key").with_base_url(server.uri());
        let messages = vec![Message::user("schema of orders?")];
        let response = model
            .create_message(ModelRequest {
                system: None,
                messages: &messages,
                tools: &[],
                max_tokens: 64,
            })
            .await
            .unwrap();

        assert_eq!(
            response.content,
            vec![ContentBlock::tool_use("call_9", "get_schema", json!({"table_name": "orders"}))]
        );
        assert_eq!(response.usage.total(), 12);
    }

    #[tokio::test]
    async fn empty_answer_is_kept_as_text_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": ""}, "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;

        let model = OpenAIModel::new("key").with_base_url(server.uri());
        let messages = vec![Message::user("say nothing")];
        let response = model
            .create_message(ModelRequest {
                system: None,
                messages: &messages,
                tools: &[],
                max_tokens: 64,
            })
            .await
            .unwrap();

        assert_eq!(response.content, vec![ContentBlock::text("")]);
        assert_eq!(response.final_text(), Some(""));
    }
}
