use crate::traits::{ContentBlock, Message, Model, ModelRequest, ModelResponse, ToolDescriptor, Usage};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-7-sonnet-20250219";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDescriptor],
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

fn no_tools(tools: &&[ToolDescriptor]) -> bool {
    tools.is_empty()
}

/// Anthropic Messages API. The transcript types serialize to its wire format
/// directly, so requests borrow the transcript without conversion.
pub struct AnthropicModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicModel {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key: api_key.into(),
            model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            base_url: "https://api.anthropic.com".to_string(),
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
}

#[async_trait]
impl Model for AnthropicModel {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn create_message(&self, request: ModelRequest<'_>) -> anyhow::Result<ModelResponse> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            system: request.system,
            messages: request.messages,
            tools: request.tools,
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("Failed to reach Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return match serde_json::from_str::<AnthropicErrorBody>(&error_text) {
                Ok(body) => Err(anyhow::anyhow!(
                    "Anthropic API error {} ({}): {}",
                    status,
                    body.error.kind,
                    body.error.message
                )),
                Err(_) => Err(anyhow::anyhow!("Anthropic API error {}: {}", status, error_text)),
            };
        }

        let body: AnthropicResponse = response
            .json()
            .await
            .context("Failed to decode Anthropic response")?;

        Ok(ModelResponse {
            content: body.content,
            usage: body.usage,
            stop_reason: body.stop_reason,
        })
    }
}
