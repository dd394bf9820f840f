use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

use super::base::Usage;
use crate::errors::{ProviderError, ProviderErrorKind};
use crate::models::content::{Content, ImageContent};
use crate::models::delta::Delta;
use crate::models::message::{AttachmentRef, Message, MessageContent};
use crate::models::tool::Tool;

lazy_static! {
    static ref INVALID_FUNCTION_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImageFormat {
    OpenAi,
    Anthropic,
}

/// Convert internal Message format to OpenAI's API message specification
pub fn messages_to_openai_spec(messages: &[Message], image_format: &ImageFormat) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut converted = json!({
            "role": message.role
        });
        let mut tool_calls = Vec::new();
        let mut output = Vec::new();

        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.text.is_empty() {
                        converted["content"] = json!(text.text);
                    }
                }
                MessageContent::ToolRequest(request) => {
                    // Malformed calls are replayed with empty arguments; their error
                    // result follows in the next tool message.
                    let arguments = match &request.tool_call {
                        Ok(call) => call.arguments.to_string(),
                        Err(_) => "{}".to_string(),
                    };
                    tool_calls.push(json!({
                        "id": request.id,
                        "type": "function",
                        "function": {
                            "name": sanitize_function_name(&request.name),
                            "arguments": arguments,
                        }
                    }));
                }
                MessageContent::ToolResponse(response) => match &response.tool_result {
                    Ok(contents) => {
                        let mut tool_content = Vec::new();
                        let mut image_messages = Vec::new();

                        for content in contents {
                            match content {
                                Content::Image(image) => {
                                    tool_content.push(Content::text(
                                        "This tool result included an image that is uploaded in the next message.",
                                    ));
                                    image_messages.push(json!({
                                        "role": "user",
                                        "content": [convert_image(image, image_format)]
                                    }));
                                }
                                _ => tool_content.push(content.clone()),
                            }
                        }

                        output.push(json!({
                            "role": "tool",
                            "content": tool_content,
                            "tool_call_id": response.id
                        }));
                        output.extend(image_messages);
                    }
                    Err(e) => {
                        // A tool result error is shown as output so the model can interpret the error message
                        output.push(json!({
                            "role": "tool",
                            "content": format!("The tool call returned the following error:\n{}", e),
                            "tool_call_id": response.id
                        }));
                    }
                },
                MessageContent::Image(image) => {
                    converted["content"] = json!([convert_image(image, image_format)]);
                }
                MessageContent::Attachment(attachment) => {
                    converted["content"] = json!(describe_attachment(attachment));
                }
            }
        }

        if !tool_calls.is_empty() {
            converted["tool_calls"] = json!(tool_calls);
        }
        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            output.insert(0, converted);
        }
        messages_spec.extend(output);
    }

    messages_spec
}

/// Convert an image content into an image json based on format
pub fn convert_image(image: &ImageContent, image_format: &ImageFormat) -> Value {
    match image_format {
        ImageFormat::OpenAi => json!({
            "type": "image_url",
            "image_url": {
                "url": format!("data:{};base64,{}", image.mime_type, image.data)
            }
        }),
        ImageFormat::Anthropic => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image.mime_type,
                "data": image.data,
            }
        }),
    }
}

pub fn describe_attachment(attachment: &AttachmentRef) -> String {
    match &attachment.name {
        Some(name) => format!(
            "[attachment {} ({}) at {}]",
            name, attachment.mime_type, attachment.uri
        ),
        None => format!("[attachment ({}) at {}]", attachment.mime_type, attachment.uri),
    }
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>, ProviderError> {
    let mut tool_names = HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(ProviderError::fatal(
                "openai",
                format!("Duplicate tool name: {}", tool.name),
            ));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": sanitize_function_name(&tool.name),
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

/// Convert a complete (non streamed) chat completion into the deltas a stream
/// of the same response would have produced.
pub fn openai_response_to_deltas(provider: &str, response: &Value) -> Result<Vec<Delta>, ProviderError> {
    if let Some(message) = response.get("error").and_then(|_| extract_error_message(response)) {
        let kind = classify_error_message(&message).unwrap_or(ProviderErrorKind::Fatal);
        return Err(ProviderError::new(kind, provider, message));
    }

    let choice = response
        .get("choices")
        .and_then(|choices| choices.get(0))
        .ok_or_else(|| ProviderError::fatal(provider, "response contained no choices"))?;
    let original = &choice["message"];
    let mut deltas = Vec::new();

    if let Some(text) = original.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            deltas.push(Delta::text(text));
        }
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(Value::as_array) {
        for (index, tool_call) in tool_calls.iter().enumerate() {
            let id = tool_call["id"].as_str().unwrap_or_default().to_string();
            let name = tool_call["function"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            // Ollama returns arguments as an object rather than an encoded string
            let arguments = match &tool_call["function"]["arguments"] {
                Value::String(arguments) => arguments.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };

            deltas.push(Delta::ToolCallStart { index, id, name });
            if !arguments.is_empty() {
                deltas.push(Delta::ToolCallArgs {
                    index,
                    fragment: arguments,
                });
            }
            deltas.push(Delta::ToolCallEnd {
                index,
                truncated: false,
            });
        }
    }

    if let Some(usage) = response.get("usage").and_then(openai_usage) {
        deltas.push(Delta::Usage { usage });
    }

    let stop_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(String::from);
    deltas.push(Delta::Done { stop_reason });
    Ok(deltas)
}

pub fn openai_usage(usage: &Value) -> Option<Usage> {
    if !usage.is_object() {
        return None;
    }
    let input = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(Usage::new(saturate(input), saturate(output)))
}

pub fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_FUNCTION_CHARS.replace_all(name, "_").to_string()
}

/// Pull a human readable message out of a vendor error body
pub fn extract_error_message(body: &Value) -> Option<String> {
    match body.get("error") {
        Some(Value::String(message)) => Some(message.clone()),
        Some(error) => error
            .get("message")
            .and_then(Value::as_str)
            .map(String::from),
        None => body.get("message").and_then(Value::as_str).map(String::from),
    }
}

/// Keyword based classification for errors that arrive without a useful status,
/// such as error events inside an otherwise successful stream.
pub fn classify_error_message(message: &str) -> Option<ProviderErrorKind> {
    let message = message.to_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|needle| message.contains(needle));

    if contains_any(&["content_policy", "content policy", "content_filter", "safety system"]) {
        Some(ProviderErrorKind::ContentPolicy)
    } else if contains_any(&["rate limit", "rate_limit", "too many requests", "quota"]) {
        Some(ProviderErrorKind::RateLimit)
    } else if contains_any(&["invalid api key", "invalid_api_key", "unauthorized", "authentication"]) {
        Some(ProviderErrorKind::Auth)
    } else if contains_any(&["overloaded", "timeout", "timed out", "temporarily unavailable", "server_error"]) {
        Some(ProviderErrorKind::Transient)
    } else {
        None
    }
}
