//! Conversation history backends, keyed by the history id a document
//! declares and addressed by components through `ComponentContext`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[async_trait]
pub trait HistoryBackend: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Vec<Message>>;
    async fn append(&self, session_id: &str, role: &str, content: &str) -> Result<()>;
    async fn set(&self, session_id: &str, messages: Vec<Message>) -> Result<()>;
    async fn clear(&self, session_id: &str) -> Result<()>;
}

/// In-memory conversation history, optionally bounded to the most recent
/// `max_turns` messages (a "turn" here is one stored message, matching the
/// source's `InMemoryHistoryBackend`).
pub struct InMemoryHistoryBackend {
    storage: Mutex<HashMap<String, Vec<Message>>>,
    max_turns: Option<usize>,
}

impl InMemoryHistoryBackend {
    pub fn new(max_turns: Option<usize>) -> Self {
        Self { storage: Mutex::new(HashMap::new()), max_turns }
    }

    fn truncate(&self, messages: &mut Vec<Message>) {
        if let Some(max) = self.max_turns {
            if messages.len() > max {
                let excess = messages.len() - max;
                messages.drain(0..excess);
            }
        }
    }
}

#[async_trait]
impl HistoryBackend for InMemoryHistoryBackend {
    async fn get(&self, session_id: &str) -> Result<Vec<Message>> {
        let storage = self.storage.lock().await;
        Ok(storage.get(session_id).cloned().unwrap_or_default())
    }

    async fn append(&self, session_id: &str, role: &str, content: &str) -> Result<()> {
        let mut storage = self.storage.lock().await;
        let entry = storage.entry(session_id.to_string()).or_default();
        entry.push(Message { role: role.to_string(), content: content.to_string() });
        self.truncate(entry);
        Ok(())
    }

    async fn set(&self, session_id: &str, messages: Vec<Message>) -> Result<()> {
        let mut storage = self.storage.lock().await;
        let mut messages = messages;
        self.truncate(&mut messages);
        storage.insert(session_id.to_string(), messages);
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        let mut storage = self.storage.lock().await;
        storage.remove(session_id);
        Ok(())
    }
}

pub type HistoryRegistry = HashMap<String, Arc<dyn HistoryBackend>>;

/// Build a prompt-ready message list: optional system message, then
/// history (capped at `max_history` most-recent entries), then the current
/// prompt as a trailing user turn.
pub fn build_messages_with_history(
    prompt: &str,
    history: &[Message],
    system_message: Option<&str>,
    max_history: Option<usize>,
) -> Vec<Message> {
    let mut messages = Vec::new();
    if let Some(system) = system_message {
        messages.push(Message { role: "system".into(), content: system.into() });
    }
    let slice = match max_history {
        Some(max) if history.len() > max => &history[history.len() - max..],
        _ => history,
    };
    messages.extend(slice.iter().cloned());
    messages.push(Message { role: "user".into(), content: prompt.into() });
    messages
}

/// Append a user/assistant turn pair to an existing history, returning the
/// updated list.
pub fn append_turn(history: &[Message], user_message: &str, assistant_message: &str) -> Vec<Message> {
    let mut result = history.to_vec();
    result.push(Message { role: "user".into(), content: user_message.into() });
    result.push(Message { role: "assistant".into(), content: assistant_message.into() });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_and_reads_back() {
        let backend = InMemoryHistoryBackend::new(None);
        backend.append("s1", "user", "hi").await.unwrap();
        backend.append("s1", "assistant", "hello").await.unwrap();
        let history = backend.get("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
    }

    #[tokio::test]
    async fn truncates_to_max_turns() {
        let backend = InMemoryHistoryBackend::new(Some(2));
        backend.append("s1", "user", "1").await.unwrap();
        backend.append("s1", "assistant", "2").await.unwrap();
        backend.append("s1", "user", "3").await.unwrap();
        let history = backend.get("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "2");
    }

    #[test]
    fn build_messages_prepends_system_and_appends_prompt() {
        let history = vec![Message { role: "user".into(), content: "hi".into() }];
        let messages = build_messages_with_history("next", &history, Some("sys"), None);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages.last().unwrap().content, "next");
    }
}
