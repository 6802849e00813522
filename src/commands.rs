// Commands exposed to the front end. Each one logs the request, does the
// work through AppState and turns failures into a user-facing message.

use crate::classify;
use crate::config;
use crate::error::ChatError;
use crate::models::{ClassifiedLogs, RenderedTurn, Session, Settings};
use crate::session::Exchange;
use crate::state::AppState;
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

/// Fields to change in `save_settings`; `None` keeps the current value.
#[derive(Debug, Default, Clone)]
pub struct SettingsUpdate {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub api_base: Option<String>,
    pub user_persona: Option<String>,
    pub user_note: Option<String>,
    pub system_prompt: Option<String>,
    pub context_size: Option<String>,
}

impl SettingsUpdate {
    pub fn apply(self, settings: &mut Settings) {
        let fields = [
            (self.api_key, &mut settings.api_key),
            (self.model, &mut settings.model),
            (self.api_base, &mut settings.api_base),
            (self.user_persona, &mut settings.user_persona),
            (self.user_note, &mut settings.user_note),
            (self.system_prompt, &mut settings.system_prompt),
            (self.context_size, &mut settings.context_size),
        ];
        for (value, slot) in fields {
            if let Some(value) = value {
                *slot = value;
            }
        }
    }
}

/// The chat screen: header plus turns.
#[derive(Debug, Serialize)]
pub struct ChatView {
    pub character_name: Option<String>,
    pub turns: Vec<RenderedTurn>,
}

fn user_message(err: ChatError) -> String {
    match err {
        ChatError::InvalidFormat(e) => format!("Not a valid chat log file: {}", e),
        ChatError::Busy => "Still waiting for the previous reply.".to_string(),
        other => other.to_string(),
    }
}

// --- Settings ---

pub async fn load_settings(state: &AppState) -> Result<Settings, String> {
    log::info!("Loading settings");
    let loaded = {
        let storage = state.storage.lock().await;
        storage.load_settings().await.map_err(|e| {
            log::error!("Failed to load settings: {:?}", e);
            format!("Failed to load settings: {}", e)
        })?
    };
    *state.settings.lock().await = loaded.clone();
    Ok(loaded)
}

/// Applies `update`, writes all fields and re-persists the chat log if one is
/// loaded. Returns the confirmation line to show.
pub async fn save_settings(state: &AppState, update: SettingsUpdate) -> Result<String, String> {
    log::info!("Saving settings");
    let mut settings = state.settings_snapshot().await;
    update.apply(&mut settings);

    {
        let storage = state.storage.lock().await;
        storage.save_settings(&settings).await.map_err(|e| {
            log::error!("Failed to save settings: {:?}", e);
            format!("Failed to save settings: {}", e)
        })?;
    }
    *state.settings.lock().await = settings;

    match state.chat.save().await {
        Ok(true) => Ok("Settings and chat log saved.".to_string()),
        Ok(false) => Ok("Settings saved. (No chat log loaded yet.)".to_string()),
        Err(e) => {
            log::error!("Failed to persist chat log with settings: {:?}", e);
            Err(user_message(e))
        }
    }
}

pub fn store_api_key(api_key: &str) -> Result<String, String> {
    log::info!("Storing API key in keyring");
    if api_key.trim().is_empty() {
        return Err("API key cannot be empty.".to_string());
    }
    config::set_api_key_in_keyring(api_key.trim()).map_err(|e| {
        log::error!("Failed to store API key: {:?}", e);
        format!("Failed to store API key: {:#}", e)
    })?;
    Ok("API key stored. Set the API key setting to `keyring` to use it.".to_string())
}

// --- Screens ---

pub async fn open_screen(state: &AppState, screen_id: &str) -> Result<String, String> {
    log::info!("Opening screen: {}", screen_id);
    let mut router = state.router.lock().await;
    if router.open(screen_id) {
        Ok(router.current().to_string())
    } else {
        Err(format!(
            "Unknown screen '{}'. Available: {}",
            screen_id,
            router.screens().join(", ")
        ))
    }
}

pub async fn go_home(state: &AppState) -> String {
    let mut router = state.router.lock().await;
    router.go_home();
    router.current().to_string()
}

// --- Chat log ---

pub async fn import_chat_log(state: &AppState, path: &Path) -> Result<Session, String> {
    log::info!("Importing chat log from {}", path.display());
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        log::error!("Failed to read {}: {:?}", path.display(), e);
        format!("Failed to read {}: {}", path.display(), e)
    })?;
    state.chat.import_from_bytes(&bytes).await.map_err(user_message)
}

/// Startup restore. A corrupt stored log is reported here once and
/// otherwise ignored; the app carries on with no chat loaded.
pub async fn restore_session(state: &AppState) -> Result<Option<Session>, String> {
    state.chat.restore_from_storage().await.map_err(|e| match e {
        ChatError::InvalidFormat(detail) => {
            format!("Saved chat log could not be read and was skipped: {}", detail)
        }
        other => user_message(other),
    })
}

pub async fn render_chat(state: &AppState) -> ChatView {
    ChatView {
        character_name: state.chat.session().await.map(|s| s.character_name),
        turns: state.chat.render().await,
    }
}

pub async fn send_message(state: &AppState, content: &str) -> Result<Option<Exchange>, String> {
    log::info!("Sending message ({} chars)", content.len());
    let settings = state.settings_snapshot().await;
    state
        .chat
        .send_message(&settings, content)
        .await
        .map_err(|e| {
            log::warn!("Send rejected: {}", e);
            user_message(e)
        })
}

/// Accepts a full message id or an unambiguous prefix of one.
pub async fn resolve_message_id(state: &AppState, id: &str) -> Result<Uuid, String> {
    let id = id.trim();
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }
    if id.is_empty() {
        return Err("Message ID cannot be empty.".to_string());
    }
    let session = state.chat.session().await.ok_or_else(|| user_message(ChatError::NoSession))?;
    let mut matches = session
        .messages
        .iter()
        .filter(|m| m.id.to_string().starts_with(id));
    match (matches.next(), matches.next()) {
        (Some(message), None) => Ok(message.id),
        (None, _) => Err(format!("No message with ID {}", id)),
        (Some(_), Some(_)) => Err(format!("Message ID prefix {} is ambiguous", id)),
    }
}

pub async fn edit_message(state: &AppState, message_id: &str, new_text: &str) -> Result<(), String> {
    log::info!("Editing message {}", message_id);
    let id = resolve_message_id(state, message_id).await?;
    match state.chat.edit_message(id, new_text).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(format!("No message with ID {}", id)),
        Err(e) => {
            log::error!("Failed to edit message {}: {:?}", id, e);
            Err(user_message(e))
        }
    }
}

pub async fn delete_message(state: &AppState, message_id: &str) -> Result<(), String> {
    log::warn!("Deleting message {}", message_id);
    let id = resolve_message_id(state, message_id).await?;
    match state.chat.delete_message(id).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(format!("No message with ID {}", id)),
        Err(e) => {
            log::error!("Failed to delete message {}: {:?}", id, e);
            Err(user_message(e))
        }
    }
}

// --- Classification ---

pub async fn classify_file(state: &AppState, path: &Path) -> Result<ClassifiedLogs, String> {
    log::info!("Classifying conversations from {}", path.display());
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        log::error!("Failed to read {}: {:?}", path.display(), e);
        format!("Failed to read {}: {}", path.display(), e)
    })?;
    let settings = state.settings_snapshot().await;
    classify::classify_bytes(state.api_provider.as_ref(), &settings, &bytes)
        .await
        .map_err(user_message)
}
