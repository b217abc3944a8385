use crate::error::CoreError;
use async_trait::async_trait;
use courier_types::{MessageContent, MessageId, MessageKey};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Application-side message history, consulted when a peer asks for a
/// message that has fallen out of the recent-sent cache.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get_message(&self, key: &MessageKey) -> Result<Option<MessageContent>, CoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    messages: Arc<Mutex<HashMap<MessageId, MessageContent>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: MessageId, content: MessageContent) {
        self.messages.lock().await.insert(id, content);
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn get_message(&self, key: &MessageKey) -> Result<Option<MessageContent>, CoreError> {
        Ok(self.messages.lock().await.get(&key.id).cloned())
    }
}
