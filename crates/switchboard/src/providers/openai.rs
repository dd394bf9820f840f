use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::base::{AuthStyle, ByteStream, CompletionRequest, Provider, ProviderRequest};
use super::http::HttpTransport;
use super::sse::{drive, OpenToolCalls, SseEvent, StreamParser};
use super::utils::{
    classify_error_message, extract_error_message, messages_to_openai_spec,
    openai_response_to_deltas, openai_usage, tools_to_openai_spec, ImageFormat,
};
use crate::errors::{ProviderError, ProviderErrorKind};
use crate::models::delta::{Delta, DeltaStream};

pub const OPENAI_DEFAULT_HOST: &str = "https://api.openai.com";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OpenAiProviderConfig {
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_host() -> String {
    OPENAI_DEFAULT_HOST.to_string()
}

impl Default for OpenAiProviderConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
        }
    }
}

pub struct OpenAiProvider {
    transport: HttpTransport,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self, ProviderError> {
        let transport = HttpTransport::new(Duration::from_secs(600))?; // 10 minutes timeout
        Ok(Self { transport, config })
    }
}

/// Build a chat completions payload; shared with other OpenAI compatible adapters.
pub fn chat_completion_payload(
    provider: &str,
    request: &CompletionRequest,
    stream: bool,
) -> Result<Value, ProviderError> {
    let mut messages_array = Vec::new();
    if !request.system.is_empty() {
        messages_array.push(json!({
            "role": "system",
            "content": request.system
        }));
    }
    messages_array.extend(messages_to_openai_spec(&request.messages, &ImageFormat::OpenAi));

    let mut payload = json!({
        "model": request.model,
        "messages": messages_array,
        "stream": stream,
    });

    if stream {
        payload["stream_options"] = json!({"include_usage": true});
    }
    if !request.tools.is_empty() {
        let tools_spec = tools_to_openai_spec(&request.tools)
            .map_err(|e| ProviderError::fatal(provider, e.message))?;
        payload["tools"] = json!(tools_spec);
    }
    if let Some(temperature) = request.temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }

    Ok(payload)
}

/// Interprets chat completion chunks. Tool call fragments arrive keyed by
/// index; the first fragment for an index carries the id and the name.
pub struct OpenAiStreamParser {
    provider: String,
    calls: OpenToolCalls,
    finish_reason: Option<String>,
}

impl OpenAiStreamParser {
    pub fn new<S: Into<String>>(provider: S) -> Self {
        Self {
            provider: provider.into(),
            calls: OpenToolCalls::default(),
            finish_reason: None,
        }
    }

    fn finish(&mut self) -> Vec<Delta> {
        let mut deltas = self.calls.close_all(false);
        deltas.push(Delta::Done {
            stop_reason: self.finish_reason.take(),
        });
        deltas
    }
}

impl StreamParser for OpenAiStreamParser {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn on_event(&mut self, event: SseEvent) -> Vec<Delta> {
        let data = event.data.trim();
        if data == "[DONE]" {
            return self.finish();
        }

        let chunk: Value = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(provider = %self.provider, error = %e, "skipping unparseable chunk");
                return Vec::new();
            }
        };

        if chunk.get("error").is_some() {
            let message = extract_error_message(&chunk).unwrap_or_else(|| chunk.to_string());
            let kind = classify_error_message(&message).unwrap_or(ProviderErrorKind::Fatal);
            return self
                .calls
                .truncate(ProviderError::new(kind, &self.provider, message));
        }

        let mut deltas = Vec::new();

        if let Some(choices) = chunk.get("choices").and_then(Value::as_array) {
            for choice in choices {
                let delta = &choice["delta"];

                if let Some(text) = delta.get("content").and_then(Value::as_str) {
                    if !text.is_empty() {
                        deltas.push(Delta::text(text));
                    }
                }

                if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
                    for (position, tool_call) in tool_calls.iter().enumerate() {
                        let index = tool_call
                            .get("index")
                            .and_then(Value::as_u64)
                            .map(|index| index as usize)
                            .unwrap_or(position);

                        if !self.calls.is_open(index) {
                            let id = tool_call["id"].as_str().unwrap_or_default().to_string();
                            let name = tool_call["function"]["name"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string();
                            self.calls.open(index, &id);
                            deltas.push(Delta::ToolCallStart { index, id, name });
                        }

                        if let Some(fragment) = tool_call["function"]["arguments"].as_str() {
                            if !fragment.is_empty() {
                                deltas.push(Delta::ToolCallArgs {
                                    index,
                                    fragment: fragment.to_string(),
                                });
                            }
                        }
                    }
                }

                if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                    self.finish_reason = Some(reason.to_string());
                    deltas.extend(self.calls.close_all(false));
                }
            }
        }

        if let Some(usage) = chunk.get("usage").and_then(openai_usage) {
            deltas.push(Delta::Usage { usage });
        }

        deltas
    }

    fn on_eof(&mut self) -> Vec<Delta> {
        // A finish reason means the message was complete even if [DONE] never came
        if self.finish_reason.is_some() {
            return self.finish();
        }
        self.calls.truncate(ProviderError::truncated(&self.provider))
    }

    fn on_transport_error(&mut self, error: ProviderError) -> Vec<Delta> {
        self.calls.truncate(error)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn host(&self) -> &str {
        &self.config.host
    }

    fn auth_style(&self) -> AuthStyle {
        AuthStyle::Bearer
    }

    fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    fn translate_request(&self, request: &CompletionRequest) -> Result<ProviderRequest, ProviderError> {
        Ok(ProviderRequest {
            path: "v1/chat/completions".to_string(),
            headers: Vec::new(),
            body: chat_completion_payload(self.name(), request, true)?,
            stream: true,
        })
    }

    fn parse_stream(&self, raw: ByteStream) -> DeltaStream {
        drive(OpenAiStreamParser::new(self.name()), raw)
    }

    fn parse_whole(&self, body: Value) -> Result<Vec<Delta>, ProviderError> {
        openai_response_to_deltas(self.name(), &body)
    }
}
