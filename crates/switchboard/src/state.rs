use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::conversation::MessageStore;
use crate::errors::{StateError, ToolError, ToolResult};
use crate::models::content::Content;
use crate::models::delta::Delta;
use crate::models::message::{Message, MessageContent, MessageStatus, ToolRequest};
use crate::models::role::Role;
use crate::models::tool::ToolCall;
use crate::providers::base::Usage;

#[derive(Debug)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug)]
struct Draft {
    message: Message,
    calls: BTreeMap<usize, PendingCall>,
    usage: Usage,
    stop_reason: Option<String>,
    truncated: bool,
    finalized: bool,
}

impl Draft {
    fn new(parent_id: Option<String>) -> Self {
        Self {
            message: Message::assistant()
                .with_parent(parent_id)
                .with_status(MessageStatus::Partial),
            calls: BTreeMap::new(),
            usage: Usage::default(),
            stop_reason: None,
            truncated: false,
            finalized: false,
        }
    }

    fn end_call(&mut self, index: usize, truncated: bool) {
        let Some(call) = self.calls.remove(&index) else {
            tracing::warn!(index, "tool call ended without being started");
            return;
        };
        self.truncated |= truncated;
        let tool_call = assemble(&call, truncated);
        self.message.content.push(MessageContent::tool_request(
            call.id,
            call.name,
            tool_call,
        ));
    }
}

fn assemble(call: &PendingCall, truncated: bool) -> ToolResult<ToolCall> {
    if truncated {
        return Err(ToolError::validation(format!(
            "arguments for {} were cut off before they were complete",
            call.name
        )));
    }
    let arguments = if call.arguments.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str::<Value>(&call.arguments).map_err(|e| {
            ToolError::validation(format!("arguments for {} are not valid JSON: {}", call.name, e))
        })?
    };
    Ok(ToolCall::new(&call.name, arguments))
}

/// Creates turns bound to a message store
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn MessageStore>,
}

impl StateManager {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn begin_turn(&self, conversation_id: &str, active_path: Vec<Message>, tool_budget: u32) -> Turn {
        Turn {
            conversation_id: conversation_id.to_string(),
            store: self.store.clone(),
            active_path,
            remaining_tool_calls: tool_budget,
            cancelled: false,
            draft: None,
            usage: Usage::default(),
            message_ids: Vec::new(),
            produced_text: false,
        }
    }
}

/// Per turn working state: the active path being extended, at most one
/// assistant draft, the remaining tool call budget and accumulated usage.
pub struct Turn {
    conversation_id: String,
    store: Arc<dyn MessageStore>,
    active_path: Vec<Message>,
    remaining_tool_calls: u32,
    cancelled: bool,
    draft: Option<Draft>,
    usage: Usage,
    message_ids: Vec<String>,
    produced_text: bool,
}

impl Turn {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn active_path(&self) -> &[Message] {
        &self.active_path
    }

    fn leaf_id(&self) -> Option<String> {
        self.active_path.last().map(|message| message.id.clone())
    }

    pub fn remaining_tool_calls(&self) -> u32 {
        self.remaining_tool_calls
    }

    /// Reserve up to `requested` calls from the budget, returning how many were granted
    pub fn take_tool_budget(&mut self, requested: usize) -> usize {
        let granted = requested.min(self.remaining_tool_calls as usize);
        self.remaining_tool_calls -= granted as u32;
        granted
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Stop accepting deltas. Whatever the draft holds can still be finalized.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Usage of every call in the turn, including the one in progress
    pub fn usage(&self) -> Usage {
        match &self.draft {
            Some(draft) if !draft.finalized => self.usage.add(draft.usage),
            _ => self.usage,
        }
    }

    /// Ids of messages persisted during this turn, in order
    pub fn message_ids(&self) -> &[String] {
        &self.message_ids
    }

    /// Whether any assistant text was persisted during this turn
    pub fn produced_text(&self) -> bool {
        self.produced_text
    }

    pub fn has_open_draft(&self) -> bool {
        self.draft.as_ref().is_some_and(|draft| !draft.finalized)
    }

    pub fn draft_has_content(&self) -> bool {
        self.draft
            .as_ref()
            .is_some_and(|draft| !draft.finalized && (!draft.message.content.is_empty() || !draft.calls.is_empty()))
    }

    pub fn draft_truncated(&self) -> bool {
        self.draft.as_ref().is_some_and(|draft| draft.truncated)
    }

    pub fn stop_reason(&self) -> Option<String> {
        self.draft.as_ref().and_then(|draft| draft.stop_reason.clone())
    }

    /// Tool requests of the current (or just finalized) draft, in message order
    pub fn tool_requests(&self) -> Vec<ToolRequest> {
        self.draft
            .as_ref()
            .map(|draft| draft.message.tool_requests().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Requests in the latest assistant message that have no response on the active path yet
    pub fn pending_tool_requests(&self) -> Vec<ToolRequest> {
        let Some(position) = self
            .active_path
            .iter()
            .rposition(|message| message.role == Role::Assistant)
        else {
            return Vec::new();
        };
        let answered: Vec<&str> = self.active_path[position + 1..]
            .iter()
            .flat_map(|message| message.content.iter())
            .filter_map(MessageContent::as_tool_response)
            .map(|response| response.id.as_str())
            .collect();
        self.active_path[position]
            .tool_requests()
            .into_iter()
            .filter(|request| !answered.contains(&request.id.as_str()))
            .cloned()
            .collect()
    }

    pub fn begin_draft(&mut self) -> Result<(), StateError> {
        if self.has_open_draft() {
            return Err(StateError::DraftOpen);
        }
        self.draft = Some(Draft::new(self.leaf_id()));
        Ok(())
    }

    /// Drop an open draft without persisting it
    pub fn discard_draft(&mut self) {
        if self.has_open_draft() {
            self.draft = None;
        }
    }

    /// Fold one delta into the open draft, opening one if needed.
    /// Ignored once the turn is cancelled.
    pub fn append_delta(&mut self, delta: &Delta) {
        if self.cancelled {
            return;
        }
        if !self.has_open_draft() {
            self.draft = Some(Draft::new(self.leaf_id()));
        }
        let Some(draft) = self.draft.as_mut() else {
            return;
        };

        match delta {
            Delta::Text { text } => draft.message.push_text(text),
            Delta::ToolCallStart { index, id, name } => {
                draft.calls.insert(
                    *index,
                    PendingCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: String::new(),
                    },
                );
            }
            Delta::ToolCallArgs { index, fragment } => match draft.calls.get_mut(index) {
                Some(call) => call.arguments.push_str(fragment),
                None => tracing::warn!(index, "arguments for a tool call that was never started"),
            },
            Delta::ToolCallEnd { index, truncated } => draft.end_call(*index, *truncated),
            Delta::Usage { usage } => draft.usage = draft.usage.merge_max(*usage),
            // Reported by the caller, which ends the call on it
            Delta::Error { .. } => {}
            Delta::Done { stop_reason } => draft.stop_reason = stop_reason.clone(),
        }
    }

    /// Persist the draft with the given status. Calls that never ended are kept
    /// as truncated requests. Finalizing twice is an error and leaves the stored
    /// message untouched.
    pub async fn finalize_draft(&mut self, status: MessageStatus) -> Result<Message, StateError> {
        let Some(draft) = self.draft.as_mut() else {
            return Err(StateError::NoOpenDraft);
        };
        if draft.finalized {
            tracing::error!(
                conversation_id = %self.conversation_id,
                message_id = %draft.message.id,
                "assistant draft finalized twice"
            );
            return Err(StateError::AlreadyFinalized);
        }

        let open: Vec<usize> = draft.calls.keys().copied().collect();
        for index in open {
            draft.end_call(index, true);
        }
        draft.message.status = status;

        let message = draft.message.clone();
        self.store.append(&self.conversation_id, message.clone()).await?;

        draft.finalized = true;
        self.usage = self.usage.add(draft.usage);
        self.produced_text |= !message.text().is_empty();
        self.message_ids.push(message.id.clone());
        self.active_path.push(message.clone());
        Ok(message)
    }

    /// Persist a non-draft message (user input, tool results, notices) at the end of the active path
    pub async fn append_message(&mut self, message: Message) -> Result<Message, StateError> {
        if self.has_open_draft() {
            return Err(StateError::DraftOpen);
        }
        let message = message.with_parent(self.leaf_id());
        self.store.append(&self.conversation_id, message.clone()).await?;
        self.produced_text |= message.role == Role::Assistant && !message.text().is_empty();
        self.message_ids.push(message.id.clone());
        self.active_path.push(message.clone());
        Ok(message)
    }

    pub async fn append_tool_result(
        &mut self,
        request: &ToolRequest,
        result: ToolResult<Vec<Content>>,
    ) -> Result<Message, StateError> {
        let message = Message::tool().with_tool_response(&request.id, &request.name, result);
        self.append_message(message).await
    }
}
