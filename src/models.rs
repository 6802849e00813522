use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who spoke a turn. The import format uses `user`/`assistant`; `model` is
/// accepted as an alias since that is what the remote endpoint calls it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "model")]
    Assistant,
}

// Represents a single turn in the chat log
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")] // Imported logs carry no ids, assign one on the way in
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct UserPersona {
    #[serde(default)]
    pub information: String,
}

/// The character being chatted with and the ordered log.
///
/// Serialized with the same field names as the import file, so a persisted
/// session is itself a valid import (with ids and timestamps filled in).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub character_name: String,
    #[serde(default)]
    pub user_persona: UserPersona,
    pub messages: Vec<Message>,
}

impl Session {
    pub fn position(&self, id: Uuid) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }
}

/// Flat settings record. Every field is stored as a string, including
/// `context_size`, which is only interpreted when a reply is requested.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub user_persona: String,
    pub user_note: String,
    pub system_prompt: String,
    pub context_size: String,
}

impl Settings {
    /// Number of trailing messages to send as context. `None` means the whole
    /// log: either the configured size is 0 or it does not parse as a number.
    pub fn context_window(&self) -> Option<usize> {
        match self.context_size.trim().parse::<usize>() {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        }
    }
}

// One entry of the older archive shape: `{ "conversations": [ { "log": [...] } ] }`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Conversation {
    pub log: Vec<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversationArchive {
    pub conversations: Vec<Conversation>,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Phone,
    Message,
    Chat,
}

/// Conversations partitioned by category, input order kept within each group.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct ClassifiedLogs {
    pub phone_logs: Vec<Conversation>,
    pub message_logs: Vec<Conversation>,
    pub chat_logs: Vec<Conversation>,
}

impl ClassifiedLogs {
    pub fn push(&mut self, category: Category, conversation: Conversation) {
        match category {
            Category::Phone => self.phone_logs.push(conversation),
            Category::Message => self.message_logs.push(conversation),
            Category::Chat => self.chat_logs.push(conversation),
        }
    }

    pub fn total(&self) -> usize {
        self.phone_logs.len() + self.message_logs.len() + self.chat_logs.len()
    }
}

/// One line of the chat screen as the front end should draw it.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub enum RenderedTurn {
    Message(Message),
    /// A failed reply, shown in the assistant's slot but never stored.
    Error(String),
    /// A reply is in flight.
    Thinking,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_shape_fills_ids_and_accepts_model_alias() {
        let raw = r#"{
            "characterName": "Rin",
            "userPersona": { "information": "a friendly dorm-mate" },
            "messages": [
                { "role": "user", "content": "hi" },
                { "role": "model", "content": "hey!" }
            ]
        }"#;
        let session: Session = serde_json::from_str(raw).unwrap();
        assert_eq!(session.character_name, "Rin");
        assert_eq!(session.user_persona.information, "a friendly dorm-mate");
        assert_eq!(session.messages[1].role, Role::Assistant);
        assert_ne!(session.messages[0].id, session.messages[1].id);
    }

    #[test]
    fn missing_persona_defaults_to_empty() {
        let raw = r#"{ "characterName": "Rin", "messages": [] }"#;
        let session: Session = serde_json::from_str(raw).unwrap();
        assert!(session.user_persona.information.is_empty());
    }

    #[test]
    fn context_window_treats_zero_and_garbage_as_unbounded() {
        let mut settings = crate::config::default_settings();
        settings.context_size = "20".into();
        assert_eq!(settings.context_window(), Some(20));
        settings.context_size = "0".into();
        assert_eq!(settings.context_window(), None);
        settings.context_size = "twenty".into();
        assert_eq!(settings.context_window(), None);
    }
}
