use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::base::{AuthStyle, ByteStream, CompletionRequest, Provider, ProviderRequest, Usage};
use super::http::HttpTransport;
use super::sse::{drive, OpenToolCalls, SseEvent, StreamParser};
use super::utils::{
    classify_error_message, convert_image, describe_attachment, saturate, ImageFormat,
};
use crate::errors::{ProviderError, ProviderErrorKind};
use crate::models::delta::{Delta, DeltaStream};
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::Tool;

pub const ANTHROPIC_DEFAULT_HOST: &str = "https://api.anthropic.com";
pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnthropicProviderConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Anthropic requires an explicit output limit on every request
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_host() -> String {
    ANTHROPIC_DEFAULT_HOST.to_string()
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

impl Default for AnthropicProviderConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

pub struct AnthropicProvider {
    transport: HttpTransport,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> Result<Self, ProviderError> {
        let transport = HttpTransport::new(Duration::from_secs(600))?; // 10 minutes timeout
        Ok(Self { transport, config })
    }
}

/// Convert messages into Anthropic's alternating user/assistant blocks. Tool
/// results travel as user messages and system messages fold into the system prompt.
pub fn messages_to_anthropic_spec(messages: &[Message]) -> (Vec<Value>, Vec<String>) {
    let mut anthropic_messages: Vec<Value> = Vec::new();
    let mut system_parts = Vec::new();

    for message in messages {
        let role = match message.role {
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
            Role::System => {
                system_parts.push(message.text());
                continue;
            }
        };

        let mut blocks = Vec::new();
        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text.text}));
                    }
                }
                MessageContent::Image(image) => {
                    blocks.push(convert_image(image, &ImageFormat::Anthropic));
                }
                MessageContent::Attachment(attachment) => {
                    blocks.push(json!({"type": "text", "text": describe_attachment(attachment)}));
                }
                MessageContent::ToolRequest(request) => {
                    let input = match &request.tool_call {
                        Ok(call) => call.arguments.clone(),
                        Err(_) => json!({}),
                    };
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": request.id,
                        "name": request.name,
                        "input": input,
                    }));
                }
                MessageContent::ToolResponse(response) => {
                    let (text, is_error) = match &response.tool_result {
                        Ok(_) => (content.as_tool_response_text().unwrap_or_default(), false),
                        Err(e) => (e.to_string(), true),
                    };
                    blocks.push(json!({
                        "type": "tool_result",
                        "tool_use_id": response.id,
                        "content": text,
                        "is_error": is_error,
                    }));
                }
            }
        }

        if blocks.is_empty() {
            continue;
        }

        match anthropic_messages.last_mut() {
            Some(previous) if previous["role"] == role => {
                if let Some(content) = previous["content"].as_array_mut() {
                    content.extend(blocks);
                }
            }
            _ => anthropic_messages.push(json!({"role": role, "content": blocks})),
        }
    }

    (anthropic_messages, system_parts)
}

pub fn tools_to_anthropic_spec(tools: &[Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.input_schema,
            })
        })
        .collect()
}

fn anthropic_error(provider: &str, error: &Value) -> ProviderError {
    let message = error["message"].as_str().unwrap_or("unknown error").to_string();
    let kind = match error["type"].as_str().unwrap_or_default() {
        "overloaded_error" | "api_error" => ProviderErrorKind::Transient,
        "rate_limit_error" => ProviderErrorKind::RateLimit,
        "authentication_error" | "permission_error" => ProviderErrorKind::Auth,
        _ => classify_error_message(&message).unwrap_or(ProviderErrorKind::Fatal),
    };
    ProviderError::new(kind, provider, message)
}

fn anthropic_usage(current: Usage, usage: &Value) -> Usage {
    let input = usage
        .get("input_tokens")
        .and_then(Value::as_u64)
        .map(saturate)
        .unwrap_or(current.input_tokens);
    let output = usage
        .get("output_tokens")
        .and_then(Value::as_u64)
        .map(saturate)
        .unwrap_or(current.output_tokens);
    Usage::new(input, output)
}

/// Interprets the Messages API event stream. Content blocks are indexed, and
/// tool_use blocks become tool calls keyed by their block index.
pub struct AnthropicStreamParser {
    provider: String,
    calls: OpenToolCalls,
    usage: Usage,
    stop_reason: Option<String>,
}

impl AnthropicStreamParser {
    pub fn new<S: Into<String>>(provider: S) -> Self {
        Self {
            provider: provider.into(),
            calls: OpenToolCalls::default(),
            usage: Usage::default(),
            stop_reason: None,
        }
    }
}

impl StreamParser for AnthropicStreamParser {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn on_event(&mut self, event: SseEvent) -> Vec<Delta> {
        let data: Value = match serde_json::from_str(&event.data) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(provider = %self.provider, error = %e, "skipping unparseable event");
                return Vec::new();
            }
        };

        let event_type = data["type"]
            .as_str()
            .map(String::from)
            .or(event.event)
            .unwrap_or_default();

        match event_type.as_str() {
            "message_start" => {
                self.usage = anthropic_usage(self.usage, &data["message"]["usage"]);
                vec![Delta::Usage { usage: self.usage }]
            }
            "content_block_start" => {
                let index = data["index"].as_u64().unwrap_or_default() as usize;
                let block = &data["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        let id = block["id"].as_str().unwrap_or_default().to_string();
                        let name = block["name"].as_str().unwrap_or_default().to_string();
                        self.calls.open(index, &id);
                        vec![Delta::ToolCallStart { index, id, name }]
                    }
                    Some("text") => match block["text"].as_str() {
                        Some(text) if !text.is_empty() => vec![Delta::text(text)],
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            }
            "content_block_delta" => {
                let index = data["index"].as_u64().unwrap_or_default() as usize;
                let delta = &data["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => match delta["text"].as_str() {
                        Some(text) if !text.is_empty() => vec![Delta::text(text)],
                        _ => Vec::new(),
                    },
                    Some("input_json_delta") => match delta["partial_json"].as_str() {
                        Some(fragment) if !fragment.is_empty() => vec![Delta::ToolCallArgs {
                            index,
                            fragment: fragment.to_string(),
                        }],
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => {
                let index = data["index"].as_u64().unwrap_or_default() as usize;
                self.calls.close(index).into_iter().collect()
            }
            "message_delta" => {
                if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                if data["usage"].is_object() {
                    self.usage = anthropic_usage(self.usage, &data["usage"]);
                    vec![Delta::Usage { usage: self.usage }]
                } else {
                    Vec::new()
                }
            }
            "message_stop" => {
                let mut deltas = self.calls.close_all(false);
                deltas.push(Delta::Done {
                    stop_reason: self.stop_reason.take(),
                });
                deltas
            }
            "error" => {
                let error = anthropic_error(&self.provider, &data["error"]);
                self.calls.truncate(error)
            }
            _ => Vec::new(),
        }
    }

    fn on_eof(&mut self) -> Vec<Delta> {
        self.calls.truncate(ProviderError::truncated(&self.provider))
    }

    fn on_transport_error(&mut self, error: ProviderError) -> Vec<Delta> {
        self.calls.truncate(error)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn host(&self) -> &str {
        &self.config.host
    }

    fn auth_style(&self) -> AuthStyle {
        AuthStyle::Header("x-api-key".to_string())
    }

    fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    fn translate_request(&self, request: &CompletionRequest) -> Result<ProviderRequest, ProviderError> {
        let (messages, mut system_parts) = messages_to_anthropic_spec(&request.messages);
        if !request.system.is_empty() {
            system_parts.insert(0, request.system.clone());
        }

        let mut payload = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "stream": true,
        });
        if !system_parts.is_empty() {
            payload["system"] = json!(system_parts.join("\n\n"));
        }
        if !request.tools.is_empty() {
            payload["tools"] = json!(tools_to_anthropic_spec(&request.tools));
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }

        Ok(ProviderRequest {
            path: "v1/messages".to_string(),
            headers: vec![(
                "anthropic-version".to_string(),
                ANTHROPIC_API_VERSION.to_string(),
            )],
            body: payload,
            stream: true,
        })
    }

    fn parse_stream(&self, raw: ByteStream) -> DeltaStream {
        drive(AnthropicStreamParser::new(self.name()), raw)
    }

    fn parse_whole(&self, body: Value) -> Result<Vec<Delta>, ProviderError> {
        if body["type"] == "error" {
            return Err(anthropic_error(self.name(), &body["error"]));
        }

        let mut deltas = Vec::new();
        let blocks = body["content"]
            .as_array()
            .ok_or_else(|| ProviderError::fatal(self.name(), "response contained no content"))?;
        for (index, block) in blocks.iter().enumerate() {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(text) = block["text"].as_str() {
                        deltas.push(Delta::text(text));
                    }
                }
                Some("tool_use") => {
                    deltas.push(Delta::ToolCallStart {
                        index,
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                    });
                    deltas.push(Delta::ToolCallArgs {
                        index,
                        fragment: block["input"].to_string(),
                    });
                    deltas.push(Delta::ToolCallEnd {
                        index,
                        truncated: false,
                    });
                }
                _ => {}
            }
        }
        deltas.push(Delta::Usage {
            usage: anthropic_usage(Usage::default(), &body["usage"]),
        });
        deltas.push(Delta::Done {
            stop_reason: body["stop_reason"].as_str().map(String::from),
        });
        Ok(deltas)
    }
}
