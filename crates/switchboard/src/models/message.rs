use super::content::{Content, ImageContent, TextContent};
use super::role::Role;
use super::tool::ToolCall;
use crate::errors::ToolResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: String,
    pub name: String,
    pub tool_call: ToolResult<ToolCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub tool_result: ToolResult<Vec<Content>>,
}

/// Reference to content stored outside the conversation, such as an uploaded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub uri: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Content passed inside a message, which can be both simple content and tool content
pub enum MessageContent {
    Text(TextContent),
    Image(ImageContent),
    ToolRequest(ToolRequest),
    ToolResponse(ToolResponse),
    Attachment(AttachmentRef),
}

impl MessageContent {
    pub fn text<S: Into<String>>(text: S) -> Self {
        MessageContent::Text(TextContent { text: text.into() })
    }

    pub fn image<S: Into<String>, T: Into<String>>(data: S, mime_type: T) -> Self {
        MessageContent::Image(ImageContent {
            data: data.into(),
            mime_type: mime_type.into(),
        })
    }

    pub fn tool_request<S: Into<String>, N: Into<String>>(
        id: S,
        name: N,
        tool_call: ToolResult<ToolCall>,
    ) -> Self {
        MessageContent::ToolRequest(ToolRequest {
            id: id.into(),
            name: name.into(),
            tool_call,
        })
    }

    pub fn tool_response<S: Into<String>, N: Into<String>>(
        id: S,
        name: N,
        tool_result: ToolResult<Vec<Content>>,
    ) -> Self {
        MessageContent::ToolResponse(ToolResponse {
            id: id.into(),
            name: name.into(),
            tool_result,
        })
    }

    pub fn as_tool_request(&self) -> Option<&ToolRequest> {
        if let MessageContent::ToolRequest(ref tool_request) = self {
            Some(tool_request)
        } else {
            None
        }
    }

    pub fn as_tool_response(&self) -> Option<&ToolResponse> {
        if let MessageContent::ToolResponse(ref tool_response) = self {
            Some(tool_response)
        } else {
            None
        }
    }

    pub fn as_tool_response_text(&self) -> Option<String> {
        if let Some(tool_response) = self.as_tool_response() {
            return Some(match &tool_response.tool_result {
                Ok(contents) => contents
                    .iter()
                    .filter_map(|content| content.as_text().map(String::from))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(error) => format!("Error: {}", error),
            });
        }
        None
    }

    /// Get the text content if this is a TextContent variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(&text.text),
            _ => None,
        }
    }

    /// Character count used for context window estimates
    pub fn char_len(&self) -> usize {
        match self {
            MessageContent::Text(text) => text.text.len(),
            MessageContent::Image(image) => image.data.len(),
            MessageContent::ToolRequest(request) => match &request.tool_call {
                Ok(call) => request.name.len() + call.arguments.to_string().len(),
                Err(error) => request.name.len() + error.message.len(),
            },
            MessageContent::ToolResponse(response) => match &response.tool_result {
                Ok(contents) => contents.iter().map(Content::char_len).sum(),
                Err(error) => error.message.len(),
            },
            MessageContent::Attachment(attachment) => attachment.uri.len(),
        }
    }
}

impl From<Content> for MessageContent {
    fn from(content: Content) -> Self {
        match content {
            Content::Text(text) => MessageContent::Text(text),
            Content::Image(image) => MessageContent::Image(image),
        }
    }
}

/// Lifecycle of a persisted message. Anything other than `Complete` was cut
/// short by cancellation, disconnection or a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Complete,
    Partial,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message to or from an LLM, linked to its parent to form a conversation tree
pub struct Message {
    pub id: String,
    pub role: Role,
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub content: Vec<MessageContent>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    fn with_role(role: Role) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            role,
            created: Utc::now().timestamp(),
            parent_id: None,
            content: Vec::new(),
            status: MessageStatus::Complete,
        }
    }

    /// Create a new user message with the current timestamp
    pub fn user() -> Self {
        Self::with_role(Role::User)
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant() -> Self {
        Self::with_role(Role::Assistant)
    }

    /// Create a new message carrying tool results
    pub fn tool() -> Self {
        Self::with_role(Role::Tool)
    }

    pub fn system() -> Self {
        Self::with_role(Role::System)
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    /// Add any MessageContent to the message
    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content.push(content);
        self
    }

    /// Add text content to the message
    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_content(MessageContent::text(text))
    }

    /// Add image content to the message
    pub fn with_image<S: Into<String>, T: Into<String>>(self, data: S, mime_type: T) -> Self {
        self.with_content(MessageContent::image(data, mime_type))
    }

    /// Add a tool request to the message
    pub fn with_tool_request<S: Into<String>, N: Into<String>>(
        self,
        id: S,
        name: N,
        tool_call: ToolResult<ToolCall>,
    ) -> Self {
        self.with_content(MessageContent::tool_request(id, name, tool_call))
    }

    /// Add a tool response to the message
    pub fn with_tool_response<S: Into<String>, N: Into<String>>(
        self,
        id: S,
        name: N,
        result: ToolResult<Vec<Content>>,
    ) -> Self {
        self.with_content(MessageContent::tool_response(id, name, result))
    }

    /// Append text, merging with a trailing text block so streamed fragments
    /// accumulate into a single block.
    pub fn push_text(&mut self, fragment: &str) {
        if let Some(MessageContent::Text(text)) = self.content.last_mut() {
            text.text.push_str(fragment);
        } else {
            self.content.push(MessageContent::text(fragment));
        }
    }

    /// All text blocks concatenated
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(MessageContent::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_requests(&self) -> Vec<&ToolRequest> {
        self.content
            .iter()
            .filter_map(MessageContent::as_tool_request)
            .collect()
    }

    pub fn has_tool_response(&self) -> bool {
        self.content
            .iter()
            .any(|content| content.as_tool_response().is_some())
    }

    pub fn char_len(&self) -> usize {
        self.content.iter().map(MessageContent::char_len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolError;
    use serde_json::json;

    #[test]
    fn test_push_text_merges_trailing_text() {
        let mut message = Message::assistant();
        message.push_text("Hel");
        message.push_text("lo");
        assert_eq!(message.content.len(), 1);
        assert_eq!(message.text(), "Hello");

        let mut message = message.with_tool_request(
            "call_1",
            "calculator",
            Ok(ToolCall::new("calculator", json!({"expression": "1+1"}))),
        );
        message.push_text("!");
        assert_eq!(message.content.len(), 3);
        assert_eq!(message.text(), "Hello!");
    }

    #[test]
    fn test_tool_response_text() {
        let ok = MessageContent::tool_response(
            "call_1",
            "calculator",
            Ok(vec![Content::text("4"), Content::text("done")]),
        );
        assert_eq!(ok.as_tool_response_text(), Some("4\ndone".to_string()));

        let err = MessageContent::tool_response(
            "call_2",
            "weather",
            Err(ToolError::execution("boom")),
        );
        assert_eq!(
            err.as_tool_response_text(),
            Some("Error: execution error: boom".to_string())
        );
    }

    #[test]
    fn test_message_serialization_defaults_status() {
        let value = json!({
            "id": "m1",
            "role": "user",
            "created": 0,
            "content": [{"Text": {"text": "hi"}}]
        });
        let message: Message = serde_json::from_value(value).unwrap();
        assert_eq!(message.status, MessageStatus::Complete);
        assert_eq!(message.parent_id, None);
        assert_eq!(message.text(), "hi");
    }

    #[test]
    fn test_new_messages_get_unique_ids() {
        assert_ne!(Message::user().id, Message::user().id);
    }
}
