//! The chat session: import/restore, live turn exchange, edit and delete.
//!
//! Every mutation builds the next session, persists it, and only then swaps
//! it in, all under the session lock. Memory and storage therefore never
//! disagree, and a failed write leaves the previous session in place.

use crate::api::LLMApiProvider;
use crate::config;
use crate::error::{ChatError, ChatResult};
use crate::models::{Message, RenderedTurn, Role, Session, Settings};
use crate::storage::StorageManager;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

#[derive(Default)]
struct SessionSlot {
    session: Option<Session>,
    /// Bumped on every import, so a reply requested against a replaced
    /// session is dropped instead of landing in the new one.
    epoch: u64,
    /// Last failed reply, shown in place of an assistant turn.
    last_error: Option<String>,
}

/// Result of one send: the stored user turn, and how the reply went.
#[derive(Debug)]
pub struct Exchange {
    pub user: Message,
    pub reply: ChatResult<Message>,
}

pub struct ChatSessionManager {
    storage: Arc<Mutex<StorageManager>>,
    api_provider: Arc<dyn LLMApiProvider>,
    slot: Mutex<SessionSlot>,
    // Single reply slot: held for the whole send/reply cycle
    reply_slot: Semaphore,
}

/// The trailing part of `messages` sent as context. `None` sends everything.
pub fn context_window(messages: &[Message], window: Option<usize>) -> &[Message] {
    match window {
        Some(n) if n < messages.len() => &messages[messages.len() - n..],
        _ => messages,
    }
}

/// Behavior rules, persona and note from settings, then the fixed
/// instruction naming the character. Blank fragments are skipped.
///
/// The persona from settings wins; the one that came with the imported log
/// is used when settings leave it blank.
pub fn build_system_instruction(settings: &Settings, session: &Session) -> String {
    let persona = if settings.user_persona.trim().is_empty() {
        session.user_persona.information.trim()
    } else {
        settings.user_persona.trim()
    };

    let mut sections = Vec::new();
    if !settings.system_prompt.trim().is_empty() {
        sections.push(settings.system_prompt.trim().to_string());
    }
    if !persona.is_empty() {
        sections.push(format!("[About the user]\n{}", persona));
    }
    if !settings.user_note.trim().is_empty() {
        sections.push(format!("[Note]\n{}", settings.user_note.trim()));
    }
    sections.push(format!(
        "You are {name}. Continue the conversation as {name} and answer the user's last message with a single reply.",
        name = session.character_name
    ));
    sections.join("\n\n")
}

impl ChatSessionManager {
    pub fn new(storage: Arc<Mutex<StorageManager>>, api_provider: Arc<dyn LLMApiProvider>) -> Self {
        Self {
            storage,
            api_provider,
            slot: Mutex::new(SessionSlot::default()),
            reply_slot: Semaphore::new(1),
        }
    }

    async fn persist(&self, session: &Session) -> ChatResult<()> {
        let storage = self.storage.lock().await;
        storage.save_session(session).await?;
        Ok(())
    }

    /// Parses an import file and replaces the current session with it.
    /// On a parse failure the current session is left untouched.
    pub async fn import_from_bytes(&self, bytes: &[u8]) -> ChatResult<Session> {
        let session: Session = serde_json::from_slice(bytes).map_err(|e| {
            log::error!("Rejected chat log import: {}", e);
            ChatError::InvalidFormat(e.to_string())
        })?;

        let mut slot = self.slot.lock().await;
        self.persist(&session).await?;
        slot.session = Some(session.clone());
        slot.epoch += 1;
        slot.last_error = None;
        log::info!(
            "Imported chat log for '{}' with {} messages",
            session.character_name,
            session.messages.len()
        );
        Ok(session)
    }

    /// Loads the persisted session, if any.
    ///
    /// A corrupt persisted value is logged and the manager stays empty; the
    /// `InvalidFormat` error is still returned so the caller can report it.
    pub async fn restore_from_storage(&self) -> ChatResult<Option<Session>> {
        let raw = {
            let storage = self.storage.lock().await;
            storage.load_session_json().await?
        };
        let Some(raw) = raw else {
            log::debug!("No persisted chat log found");
            return Ok(None);
        };

        let session: Session = serde_json::from_str(&raw).map_err(|e| {
            log::warn!("Persisted chat log is unreadable, starting empty: {}", e);
            ChatError::InvalidFormat(e.to_string())
        })?;

        let mut slot = self.slot.lock().await;
        slot.session = Some(session.clone());
        slot.epoch += 1;
        slot.last_error = None;
        log::info!(
            "Restored chat log for '{}' with {} messages",
            session.character_name,
            session.messages.len()
        );
        Ok(Some(session))
    }

    pub async fn session(&self) -> Option<Session> {
        self.slot.lock().await.session.clone()
    }

    /// Re-persists the current session, if one is loaded.
    pub async fn save(&self) -> ChatResult<bool> {
        let slot = self.slot.lock().await;
        match &slot.session {
            Some(session) => {
                self.persist(session).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.reply_slot.available_permits() == 0
    }

    /// Appends a user turn and persists it. Blank text is ignored.
    pub async fn append_user_message(&self, text: &str) -> ChatResult<Option<Message>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let mut slot = self.slot.lock().await;
        let current = slot.session.as_ref().ok_or(ChatError::NoSession)?;

        let message = Message::new(Role::User, text);
        let mut next = current.clone();
        next.messages.push(message.clone());
        self.persist(&next).await?;
        slot.session = Some(next);
        slot.last_error = None;
        log::debug!("Appended user message {}", message.id);
        Ok(Some(message))
    }

    /// Appends a user turn and asks the model for the reply.
    ///
    /// Fails with `Busy`, appending nothing, while another reply is pending.
    /// Blank text is a no-op and returns `Ok(None)`.
    pub async fn send_message(&self, settings: &Settings, text: &str) -> ChatResult<Option<Exchange>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let _permit = self.reply_slot.try_acquire().map_err(|_| ChatError::Busy)?;

        let Some(user) = self.append_user_message(text).await? else {
            return Ok(None);
        };
        let reply = self.reply_with_slot_held(settings).await;
        Ok(Some(Exchange { user, reply }))
    }

    /// Asks the model to answer the current log, without adding a user turn.
    pub async fn request_reply(&self, settings: &Settings) -> ChatResult<Message> {
        let _permit = self.reply_slot.try_acquire().map_err(|_| ChatError::Busy)?;
        self.reply_with_slot_held(settings).await
    }

    async fn reply_with_slot_held(&self, settings: &Settings) -> ChatResult<Message> {
        let (epoch, system_instruction, context) = {
            let slot = self.slot.lock().await;
            let session = slot.session.as_ref().ok_or(ChatError::NoSession)?;
            let context = context_window(&session.messages, settings.context_window()).to_vec();
            (slot.epoch, build_system_instruction(settings, session), context)
        };

        let result = match config::get_api_key(settings) {
            Ok(api_key) => {
                log::info!("Requesting reply with {} context messages", context.len());
                self.api_provider
                    .send_chat_request(settings, &api_key, &system_instruction, &context)
                    .await
            }
            Err(e) => Err(e),
        };

        let mut slot = self.slot.lock().await;
        if slot.epoch != epoch {
            log::warn!("Chat log was replaced while waiting for a reply; discarding it");
            return Err(ChatError::Api("chat log was replaced before the reply arrived".into()));
        }
        let text = match result {
            Ok(text) => text,
            Err(e) => {
                let notice = format!("{:#}", e);
                log::error!("Reply failed: {}", notice);
                slot.last_error = Some(notice.clone());
                return Err(ChatError::Api(notice));
            }
        };

        let current = slot.session.as_ref().ok_or(ChatError::NoSession)?;

        let message = Message::new(Role::Assistant, text);
        let mut next = current.clone();
        next.messages.push(message.clone());
        self.persist(&next).await?;
        slot.session = Some(next);
        slot.last_error = None;
        log::info!("Stored assistant reply {}", message.id);
        Ok(message)
    }

    /// Replaces the content of message `id`. Unknown ids are a no-op (`false`).
    pub async fn edit_message(&self, id: Uuid, new_text: &str) -> ChatResult<bool> {
        let mut slot = self.slot.lock().await;
        let Some(current) = slot.session.as_ref() else {
            return Ok(false);
        };
        let Some(index) = current.position(id) else {
            log::warn!("Edit ignored, no message with id {}", id);
            return Ok(false);
        };

        let mut next = current.clone();
        next.messages[index].content = new_text.to_string();
        self.persist(&next).await?;
        slot.session = Some(next);
        log::info!("Edited message {}", id);
        Ok(true)
    }

    /// Removes message `id`. Unknown ids are a no-op (`false`).
    /// Asking the user for confirmation is up to the caller.
    pub async fn delete_message(&self, id: Uuid) -> ChatResult<bool> {
        let mut slot = self.slot.lock().await;
        let Some(current) = slot.session.as_ref() else {
            return Ok(false);
        };
        let Some(index) = current.position(id) else {
            log::warn!("Delete ignored, no message with id {}", id);
            return Ok(false);
        };

        let mut next = current.clone();
        next.messages.remove(index);
        self.persist(&next).await?;
        slot.session = Some(next);
        log::info!("Deleted message {}", id);
        Ok(true)
    }

    /// What the chat screen shows: stored turns, then the last failure, then
    /// a thinking marker while a reply is in flight.
    pub async fn render(&self) -> Vec<RenderedTurn> {
        let slot = self.slot.lock().await;
        let mut turns: Vec<RenderedTurn> = slot
            .session
            .iter()
            .flat_map(|s| s.messages.iter().cloned())
            .map(RenderedTurn::Message)
            .collect();
        if let Some(error) = &slot.last_error {
            turns.push(RenderedTurn::Error(error.clone()));
        }
        if self.is_pending() {
            turns.push(RenderedTurn::Thinking);
        }
        turns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_settings, MockProvider};

    const RIN: &str = r#"{
        "characterName": "Rin",
        "userPersona": { "information": "a friendly dorm-mate" },
        "messages": [
            { "role": "user", "content": "hi" },
            { "role": "assistant", "content": "hey!" }
        ]
    }"#;

    async fn manager_with(provider: Arc<MockProvider>) -> (ChatSessionManager, Arc<Mutex<StorageManager>>) {
        let storage = Arc::new(Mutex::new(StorageManager::in_memory().await.unwrap()));
        (ChatSessionManager::new(storage.clone(), provider), storage)
    }

    fn numbered_log(count: usize) -> String {
        let messages: Vec<_> = (0..count)
            .map(|i| {
                let role = if i % 2 == 0 { "user" } else { "assistant" };
                serde_json::json!({ "role": role, "content": format!("m{}", i) })
            })
            .collect();
        serde_json::json!({ "characterName": "Rin", "messages": messages }).to_string()
    }

    fn contents(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.content.clone()).collect()
    }

    #[tokio::test]
    async fn rin_scenario() {
        let provider = Arc::new(MockProvider::replying("doing great, you?"));
        let (manager, _) = manager_with(provider.clone()).await;

        let session = manager.import_from_bytes(RIN.as_bytes()).await.unwrap();
        assert_eq!(session.character_name, "Rin");
        assert_eq!(contents(&session.messages), ["hi", "hey!"]);

        let exchange = manager
            .send_message(&test_settings(), "how are you?")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exchange.user.content, "how are you?");
        let reply = exchange.reply.unwrap();
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, "doing great, you?");

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(contents(&calls[0].messages), ["hi", "hey!", "how are you?"]);
        assert_eq!(calls[0].api_key, "test-key");
        assert_eq!(calls[0].model, config::DEFAULT_MODEL);
        assert!(calls[0].system_instruction.contains("You are Rin."));
        assert!(calls[0].system_instruction.contains("a friendly dorm-mate"));

        let session = manager.session().await.unwrap();
        assert_eq!(
            contents(&session.messages),
            ["hi", "hey!", "how are you?", "doing great, you?"]
        );
    }

    #[tokio::test]
    async fn import_persist_restore_round_trip() {
        let provider = Arc::new(MockProvider::replying("unused"));
        let (manager, storage) = manager_with(provider.clone()).await;
        let imported = manager.import_from_bytes(RIN.as_bytes()).await.unwrap();

        let fresh = ChatSessionManager::new(storage, provider);
        let restored = fresh.restore_from_storage().await.unwrap().unwrap();
        assert_eq!(restored, imported);
        assert_eq!(fresh.session().await.unwrap().messages, imported.messages);
    }

    #[tokio::test]
    async fn bad_import_keeps_previous_session() {
        let (manager, storage) = manager_with(Arc::new(MockProvider::replying("x"))).await;
        manager.import_from_bytes(RIN.as_bytes()).await.unwrap();

        let err = manager.import_from_bytes(b"{ not json").await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidFormat(_)));
        let err = manager
            .import_from_bytes(br#"{ "characterName": "Rin" }"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidFormat(_)));

        assert_eq!(manager.session().await.unwrap().character_name, "Rin");
        let raw = storage.lock().await.load_session_json().await.unwrap().unwrap();
        assert!(raw.contains("Rin"));
    }

    #[tokio::test]
    async fn corrupt_persisted_session_starts_empty() {
        let (manager, storage) = manager_with(Arc::new(MockProvider::replying("x"))).await;
        storage
            .lock()
            .await
            .set_value(config::KEY_SESSION, "{{{")
            .await
            .unwrap();

        let err = manager.restore_from_storage().await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidFormat(_)));
        assert!(manager.session().await.is_none());
    }

    #[tokio::test]
    async fn nothing_persisted_restores_none() {
        let (manager, _) = manager_with(Arc::new(MockProvider::replying("x"))).await;
        assert!(manager.restore_from_storage().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn window_sends_only_the_last_twenty() {
        let provider = Arc::new(MockProvider::replying("ok"));
        let (manager, _) = manager_with(provider.clone()).await;
        manager
            .import_from_bytes(numbered_log(25).as_bytes())
            .await
            .unwrap();

        let mut settings = test_settings();
        settings.context_size = "20".into();
        manager.request_reply(&settings).await.unwrap();

        let sent = &provider.calls()[0].messages;
        assert_eq!(sent.len(), 20);
        assert_eq!(sent[0].content, "m5");
        assert_eq!(sent[19].content, "m24");
    }

    #[tokio::test]
    async fn window_zero_sends_everything() {
        let provider = Arc::new(MockProvider::replying("ok"));
        let (manager, _) = manager_with(provider.clone()).await;
        manager
            .import_from_bytes(numbered_log(25).as_bytes())
            .await
            .unwrap();

        let mut settings = test_settings();
        settings.context_size = "0".into();
        manager.request_reply(&settings).await.unwrap();
        assert_eq!(provider.calls()[0].messages.len(), 25);
    }

    #[tokio::test]
    async fn blank_text_is_ignored() {
        let provider = Arc::new(MockProvider::replying("ok"));
        let (manager, _) = manager_with(provider.clone()).await;
        manager.import_from_bytes(RIN.as_bytes()).await.unwrap();

        assert!(manager.send_message(&test_settings(), "   \n").await.unwrap().is_none());
        assert!(provider.calls().is_empty());
        assert_eq!(manager.session().await.unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn send_without_session_fails() {
        let (manager, _) = manager_with(Arc::new(MockProvider::replying("ok"))).await;
        let err = manager.send_message(&test_settings(), "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::NoSession));
    }

    #[tokio::test]
    async fn api_failure_becomes_an_unstored_error_turn() {
        let provider = Arc::new(MockProvider::failing("503 Service Unavailable"));
        let (manager, storage) = manager_with(provider.clone()).await;
        manager.import_from_bytes(RIN.as_bytes()).await.unwrap();

        let exchange = manager
            .send_message(&test_settings(), "you there?")
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exchange.reply, Err(ChatError::Api(_))));
        assert_eq!(provider.calls().len(), 1);

        let turns = manager.render().await;
        assert_eq!(turns.len(), 4);
        assert!(matches!(&turns[3], RenderedTurn::Error(e) if e.contains("503")));

        let raw = storage.lock().await.load_session_json().await.unwrap().unwrap();
        let persisted: Session = serde_json::from_str(&raw).unwrap();
        assert_eq!(contents(&persisted.messages), ["hi", "hey!", "you there?"]);
    }

    #[tokio::test]
    async fn missing_api_key_is_an_api_error_without_a_call() {
        let provider = Arc::new(MockProvider::replying("ok"));
        let (manager, _) = manager_with(provider.clone()).await;
        manager.import_from_bytes(RIN.as_bytes()).await.unwrap();

        let settings = config::default_settings();
        let err = manager.request_reply(&settings).await.unwrap_err();
        assert!(matches!(err, ChatError::Api(_)));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn second_send_while_pending_is_busy() {
        let (provider, gate) = MockProvider::replying("later").gated();
        let provider = Arc::new(provider);
        let (manager, _) = manager_with(provider.clone()).await;
        manager.import_from_bytes(RIN.as_bytes()).await.unwrap();
        let settings = test_settings();

        let first = manager.send_message(&settings, "first");
        let second = async {
            while !manager.is_pending() {
                tokio::task::yield_now().await;
            }
            let busy = manager.send_message(&settings, "second").await;
            let busy_reply = manager.request_reply(&settings).await;
            while provider.calls().is_empty() {
                tokio::task::yield_now().await;
            }
            assert!(manager.render().await.contains(&RenderedTurn::Thinking));
            gate.notify_one();
            (busy, busy_reply)
        };
        let (first, (busy, busy_reply)) = tokio::join!(first, second);

        assert!(matches!(busy, Err(ChatError::Busy)));
        assert!(matches!(busy_reply, Err(ChatError::Busy)));
        assert_eq!(first.unwrap().unwrap().reply.unwrap().content, "later");
        assert_eq!(provider.calls().len(), 1);
        assert_eq!(
            contents(&manager.session().await.unwrap().messages),
            ["hi", "hey!", "first", "later"]
        );
        assert!(!manager.render().await.contains(&RenderedTurn::Thinking));
    }

    const NEW_LOG: &str = r#"{ "characterName": "Yui", "messages": [] }"#;

    /// Starts a reply on the Rin log, imports another log while it is pending,
    /// then lets the reply through.
    async fn reply_across_import(provider: MockProvider) -> (ChatSessionManager, ChatResult<Message>) {
        let (provider, gate) = provider.gated();
        let provider = Arc::new(provider);
        let (manager, _) = manager_with(provider.clone()).await;
        manager.import_from_bytes(RIN.as_bytes()).await.unwrap();
        let settings = test_settings();

        let reply = manager.request_reply(&settings);
        let swap = async {
            while provider.calls().is_empty() {
                tokio::task::yield_now().await;
            }
            manager.import_from_bytes(NEW_LOG.as_bytes()).await.unwrap();
            gate.notify_one();
        };
        let (reply, ()) = tokio::join!(reply, swap);
        (manager, reply)
    }

    #[tokio::test]
    async fn reply_for_a_replaced_log_is_dropped() {
        let (manager, reply) = reply_across_import(MockProvider::replying("old news")).await;

        assert!(matches!(reply, Err(ChatError::Api(_))));
        let session = manager.session().await.unwrap();
        assert_eq!(session.character_name, "Yui");
        assert!(session.messages.is_empty());
        assert!(manager.render().await.is_empty());
    }

    #[tokio::test]
    async fn failure_for_a_replaced_log_is_not_shown() {
        let (manager, reply) = reply_across_import(MockProvider::failing("503 old session")).await;

        assert!(matches!(reply, Err(ChatError::Api(_))));
        assert_eq!(manager.session().await.unwrap().character_name, "Yui");
        assert!(manager.render().await.is_empty());
    }

    #[tokio::test]
    async fn edit_replaces_only_the_target() {
        let (manager, storage) = manager_with(Arc::new(MockProvider::replying("x"))).await;
        let session = manager.import_from_bytes(RIN.as_bytes()).await.unwrap();
        let target = session.messages[0].id;

        assert!(manager.edit_message(target, "hello there").await.unwrap());
        let after = manager.session().await.unwrap();
        assert_eq!(after.messages.len(), 2);
        assert_eq!(contents(&after.messages), ["hello there", "hey!"]);
        assert_eq!(after.messages[0].id, target);
        assert_eq!(after.messages[1], session.messages[1]);

        let raw = storage.lock().await.load_session_json().await.unwrap().unwrap();
        assert!(raw.contains("hello there"));
    }

    #[tokio::test]
    async fn delete_removes_exactly_one() {
        let (manager, _) = manager_with(Arc::new(MockProvider::replying("x"))).await;
        let session = manager
            .import_from_bytes(numbered_log(4).as_bytes())
            .await
            .unwrap();

        assert!(manager.delete_message(session.messages[1].id).await.unwrap());
        let after = manager.session().await.unwrap();
        assert_eq!(contents(&after.messages), ["m0", "m2", "m3"]);
        assert_eq!(after.messages[1].id, session.messages[2].id);
    }

    #[tokio::test]
    async fn unknown_ids_are_no_ops() {
        let (manager, _) = manager_with(Arc::new(MockProvider::replying("x"))).await;
        assert!(!manager.edit_message(Uuid::new_v4(), "x").await.unwrap());

        manager.import_from_bytes(RIN.as_bytes()).await.unwrap();
        assert!(!manager.edit_message(Uuid::new_v4(), "x").await.unwrap());
        assert!(!manager.delete_message(Uuid::new_v4()).await.unwrap());
        assert_eq!(manager.session().await.unwrap().messages.len(), 2);
    }

    #[test]
    fn settings_persona_overrides_imported_one() {
        let session: Session = serde_json::from_str(RIN).unwrap();
        let mut settings = test_settings();
        settings.user_persona = "a night owl".into();
        settings.user_note = "exam week".into();

        let prompt = build_system_instruction(&settings, &session);
        assert!(prompt.starts_with(config::DEFAULT_SYSTEM_PROMPT));
        assert!(prompt.contains("a night owl"));
        assert!(!prompt.contains("dorm-mate"));
        assert!(prompt.contains("exam week"));
        assert!(prompt.ends_with("with a single reply."));
    }

    #[test]
    fn context_window_bounds() {
        let messages: Vec<Message> = (0..3).map(|i| Message::new(Role::User, i.to_string())).collect();
        assert_eq!(context_window(&messages, Some(20)).len(), 3);
        assert_eq!(context_window(&messages, Some(2))[0].content, "1");
        assert_eq!(context_window(&messages, None).len(), 3);
    }
}
