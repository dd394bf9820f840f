//! Conversations are trees of messages. Editing or regenerating a message
//! starts a sibling branch; the active path runs from the root to the
//! currently selected leaf and is what gets sent to the model.
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::models::message::Message;

#[derive(Debug, Default, Clone)]
pub struct MessageTree {
    messages: HashMap<String, Message>,
    leaf: Option<String>,
}

impl MessageTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn leaf(&self) -> Option<&str> {
        self.leaf.as_deref()
    }

    /// Insert a message under its parent and make it the active leaf
    pub fn insert(&mut self, message: Message) -> Result<(), StoreError> {
        if self.messages.contains_key(&message.id) {
            return Err(StoreError::Duplicate(message.id));
        }
        if let Some(parent) = &message.parent_id {
            if !self.messages.contains_key(parent) {
                return Err(StoreError::MissingParent(parent.clone()));
            }
        }
        self.leaf = Some(message.id.clone());
        self.messages.insert(message.id.clone(), message);
        Ok(())
    }

    /// Select a different branch by moving the active leaf
    pub fn set_leaf(&mut self, id: &str) -> Result<(), StoreError> {
        if !self.messages.contains_key(id) {
            return Err(StoreError::MissingMessage(id.to_string()));
        }
        self.leaf = Some(id.to_string());
        Ok(())
    }

    /// Children of a message, oldest first
    pub fn children(&self, id: &str) -> Vec<&Message> {
        let mut children: Vec<&Message> = self
            .messages
            .values()
            .filter(|message| message.parent_id.as_deref() == Some(id))
            .collect();
        children.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        children
    }

    /// Root to leaf, following parent links from the active leaf
    pub fn active_path(&self) -> Vec<Message> {
        let mut path = Vec::new();
        let mut cursor = self.leaf.as_deref();
        while let Some(id) = cursor {
            match self.messages.get(id) {
                Some(message) => {
                    path.push(message.clone());
                    cursor = message.parent_id.as_deref();
                }
                None => break,
            }
            // corrupted parent links
            if path.len() > self.messages.len() {
                break;
            }
        }
        path.reverse();
        path
    }
}

/// Durable storage for conversation trees
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message; it becomes the active leaf of its conversation
    async fn append(&self, conversation_id: &str, message: Message) -> Result<(), StoreError>;

    async fn read_active_path(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn set_leaf(&self, conversation_id: &str, message_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    conversations: RwLock<HashMap<String, MessageTree>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn append(&self, conversation_id: &str, message: Message) -> Result<(), StoreError> {
        let mut conversations = self
            .conversations
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .insert(message)
    }

    async fn read_active_path(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let conversations = self
            .conversations
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(conversations
            .get(conversation_id)
            .map(MessageTree::active_path)
            .unwrap_or_default())
    }

    async fn set_leaf(&self, conversation_id: &str, message_id: &str) -> Result<(), StoreError> {
        let mut conversations = self
            .conversations
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::MissingMessage(message_id.to_string()))?
            .set_leaf(message_id)
    }
}
